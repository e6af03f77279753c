//! macOS non-recursive backend built on kqueue vnode watches.
//!
//! kqueue watches nodes, not names: each existing component of the target
//! path gets its own `EVFILT_VNODE` registration, reusing the chain layout
//! from the inotify backend. A write to an intermediate directory (an entry
//! appearing or vanishing) triggers a chain rebuild; whether the target
//! itself changed is decided by re-probing its existence, since kqueue
//! events carry no child name.
//!
//! A poll thread drains the kqueue without blocking (short sleep between
//! empty polls) so the registration set can be modified from the owning
//! runner under the same state mutex.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use kqueue::{EventData, EventFilter, FilterFlag, Ident};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use pathwatch_core::TaskRunner;

use crate::chain::{self, WatchChain};
use crate::error::WatchError;
use crate::event::{ChangeCallback, ChangeEvent};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

fn vnode_flags() -> FilterFlag {
    FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_LINK
        | FilterFlag::NOTE_RENAME
        | FilterFlag::NOTE_REVOKE
}

struct KqShared {
    runner: TaskRunner,
    cancelled: AtomicBool,
    state: Mutex<KqState>,
}

struct KqState {
    target: PathBuf,
    /// Watch handles are the registered paths themselves; kqueue keys
    /// registrations by filename.
    chain: WatchChain<PathBuf>,
    target_exists: bool,
    watcher: kqueue::Watcher,
    callback: Option<ChangeCallback>,
}

impl KqShared {
    /// Walks the chain root to leaf, registering every component that
    /// exists and dropping registrations for ones that no longer do. A
    /// single `kevent` syscall commits the whole batch at the end.
    fn update_watches(&self, state: &mut KqState) {
        debug_assert!(self.runner.belongs_to_current_thread());
        debug_assert!(chain::is_valid(&state.chain));

        let mut path = chain::watch_root(&state.target);
        let mut blocked = false;
        let mut dirty = false;

        for index in 0..state.chain.len() {
            let mut desired = (!blocked && path.exists()).then(|| path.clone());

            if state.chain[index].watch != desired {
                if let Some(old) = state.chain[index].watch.take() {
                    let _ = state.watcher.remove_filename(&old, EventFilter::EVFILT_VNODE);
                    dirty = true;
                }
                if let Some(new) = &desired {
                    match state
                        .watcher
                        .add_filename(new, EventFilter::EVFILT_VNODE, vnode_flags())
                    {
                        Ok(()) => dirty = true,
                        Err(err) => {
                            // Raced away between the probe and the add.
                            trace!(path = %new.display(), error = %err, "kqueue add failed");
                            desired = None;
                        }
                    }
                }
                state.chain[index].watch = desired;
            }

            blocked = state.chain[index].watch.is_none();
            if !state.chain[index].subdir.is_empty() {
                path.push(&state.chain[index].subdir);
            }
        }

        if dirty
            && let Err(err) = state.watcher.watch()
        {
            warn!(error = %err, "kqueue registration batch failed");
        }
    }

    /// Posted for every raw vnode event. Rebuilds the chain, then decides
    /// delivery: a hit on the target node itself always fires, and any
    /// event that flipped the target's existence fires.
    fn on_vnode_event(self: &Arc<Self>, path: &Path) {
        debug_assert!(self.runner.belongs_to_current_thread());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return;
        }

        self.update_watches(&mut state);
        let was = state.target_exists;
        state.target_exists = state.target.exists();

        if path == state.target || state.target_exists != was {
            self.deliver(state, false);
        }
    }

    fn deliver(self: &Arc<Self>, mut state: MutexGuard<'_, KqState>, error: bool) {
        let Some(mut callback) = state.callback.take() else {
            return;
        };
        let event = if error {
            ChangeEvent::failed(state.target.clone())
        } else {
            ChangeEvent::new(state.target.clone())
        };
        drop(state);
        callback(event);
        if !error && !self.cancelled.load(Ordering::SeqCst) {
            self.state.lock().callback = Some(callback);
        }
    }

    fn teardown(&self) {
        let mut state = self.state.lock();
        let state = &mut *state;
        state.callback = None;
        let mut dirty = false;
        for entry in &mut state.chain {
            if let Some(old) = entry.watch.take() {
                let _ = state.watcher.remove_filename(&old, EventFilter::EVFILT_VNODE);
                dirty = true;
            }
        }
        if dirty {
            let _ = state.watcher.watch();
        }
        debug!(target = %state.target.display(), "kqueue watch torn down");
    }
}

fn spawn_poll_thread(shared: Arc<KqShared>) -> io::Result<()> {
    thread::Builder::new()
        .name("pathwatch kqueue poll".into())
        .spawn(move || {
            loop {
                if shared.cancelled.load(Ordering::SeqCst) {
                    return;
                }
                // Non-blocking drain so the lock is never held across a
                // kernel wait.
                let event = { shared.state.lock().watcher.poll(None) };
                match event {
                    Some(kqueue::Event {
                        data: EventData::Vnode(_),
                        ident: Ident::Filename(_, path),
                    }) => {
                        let path = PathBuf::from(path);
                        let task_target = Arc::clone(&shared);
                        shared.runner.post(move || task_target.on_vnode_event(&path));
                    }
                    Some(_) => {}
                    None => thread::sleep(POLL_INTERVAL),
                }
            }
        })?;
    Ok(())
}

/// A non-recursive kqueue-backed watch.
pub(crate) struct KqueueWatcher {
    shared: Arc<KqShared>,
}

impl KqueueWatcher {
    pub(crate) fn watch(
        runner: TaskRunner,
        target: &Path,
        callback: ChangeCallback,
    ) -> Result<Self, WatchError> {
        debug_assert!(runner.belongs_to_current_thread());
        let watcher = kqueue::Watcher::new().map_err(WatchError::Io)?;
        let shared = Arc::new(KqShared {
            runner,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(KqState {
                target: target.to_path_buf(),
                chain: chain::build(target),
                target_exists: target.exists(),
                watcher,
                callback: Some(callback),
            }),
        });
        {
            let mut state = shared.state.lock();
            shared.update_watches(&mut state);
        }
        spawn_poll_thread(Arc::clone(&shared))?;
        debug!(target = %target.display(), "kqueue watch established");
        Ok(Self { shared })
    }

    pub(crate) fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.shared.runner.belongs_to_current_thread() {
            self.shared.teardown();
            return;
        }
        let shared = Arc::clone(&self.shared);
        if !self.shared.runner.post(move || shared.teardown()) {
            self.shared.teardown();
        }
    }
}

impl Drop for KqueueWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
