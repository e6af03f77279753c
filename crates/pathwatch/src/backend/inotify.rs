//! Linux backend built on inotify.
//!
//! All watches in the process share a single inotify instance, serviced by
//! one blocking reader thread. The reader owns a registration table mapping
//! each kernel watch descriptor to the watchers interested in it; a raw
//! event is fanned out by posting one classification task per interested
//! watcher onto that watcher's owning runner. The reader thread itself
//! never touches watcher state.
//!
//! Kernel watch descriptors are refcounted through the table: several
//! watchers (or several chain levels of one watcher) can share a
//! descriptor, and the kernel watch is removed only when the last
//! registration goes away.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;

use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask, Watches};
use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use pathwatch_core::{TaskRunner, subdirectories};

use crate::chain::{self, ChainEntry, WatchChain};
use crate::event::{ChangeCallback, ChangeEvent};

static NEXT_WATCHER_ID: AtomicUsize = AtomicUsize::new(1);

static SHARED_READER: OnceLock<Option<Arc<InotifyReader>>> = OnceLock::new();

/// Returns the process-wide inotify reader, spawning it on first use.
///
/// `None` if the inotify instance could not be created (fd or watch limits
/// exhausted), or if a previously spawned reader has since died; either
/// way the condition is sticky for the life of the process, and callers
/// fail the watch synchronously instead of arming one that can never
/// deliver.
pub(crate) fn shared_reader() -> Option<Arc<InotifyReader>> {
    SHARED_READER
        .get_or_init(|| match InotifyReader::spawn() {
            Ok(reader) => Some(reader),
            Err(err) => {
                error!(error = %err, "failed to initialize inotify");
                None
            }
        })
        .clone()
        .filter(|reader| reader.usable())
}

fn watch_mask() -> WatchMask {
    WatchMask::ATTRIB
        | WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::CLOSE_WRITE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
}

/// One watcher's registration against a kernel watch descriptor. Several
/// chain levels of the same watcher can hold the same descriptor (a
/// symlink watched through the parent the chain already watches), so the
/// registration is refcounted per watcher.
struct Sink {
    watcher_id: usize,
    refs: usize,
    shared: Weak<Shared>,
}

/// Owner of the shared inotify instance and its reader thread.
pub(crate) struct InotifyReader {
    watches: Mutex<Watches>,
    registry: Mutex<FxHashMap<WatchDescriptor, Vec<Sink>>>,
    healthy: AtomicBool,
}

impl InotifyReader {
    fn spawn() -> io::Result<Arc<Self>> {
        let inotify = Inotify::init()?;
        let watches = inotify.watches();
        let reader = Arc::new(Self {
            watches: Mutex::new(watches),
            registry: Mutex::new(FxHashMap::default()),
            healthy: AtomicBool::new(true),
        });
        let for_thread = Arc::clone(&reader);
        thread::Builder::new()
            .name("pathwatch inotify reader".into())
            .spawn(move || for_thread.run(inotify))?;
        Ok(reader)
    }

    fn run(self: Arc<Self>, mut inotify: Inotify) {
        let mut buffer = [0u8; 4096];
        loop {
            match inotify.read_events_blocking(&mut buffer) {
                Ok(events) => {
                    for event in events {
                        self.dispatch(&event);
                    }
                }
                Err(err) => {
                    error!(error = %err, "inotify read failed, shutting down all watches");
                    self.poison();
                    return;
                }
            }
        }
    }

    fn dispatch(&self, event: &inotify::Event<&OsStr>) {
        if event.mask.contains(EventMask::Q_OVERFLOW) {
            // Best-effort contract: consumers re-probe on notification, so a
            // dropped event window degrades latency, not correctness.
            warn!("inotify event queue overflowed");
            return;
        }
        if event.mask.contains(EventMask::IGNORED) {
            trace!(wd = ?event.wd, "watch descriptor retired by kernel");
            return;
        }

        let created = event
            .mask
            .intersects(EventMask::CREATE | EventMask::MOVED_TO);
        let deleted = event
            .mask
            .intersects(EventMask::DELETE | EventMask::MOVED_FROM);
        let is_directory = event.mask.contains(EventMask::ISDIR);
        let child: OsString = event.name.map(OsStr::to_owned).unwrap_or_default();

        let interested: Vec<Arc<Shared>> = {
            let registry = self.registry.lock();
            match registry.get(&event.wd) {
                Some(sinks) => sinks.iter().filter_map(|sink| sink.shared.upgrade()).collect(),
                None => return,
            }
        };

        for shared in interested {
            let wd = event.wd.clone();
            let child = child.clone();
            let task_target = Arc::clone(&shared);
            shared.runner.post(move || {
                task_target.on_change(&wd, &child, created, deleted, is_directory);
            });
        }
    }

    /// Installs a kernel watch on `path` and registers `shared` for its
    /// events. `Ok(None)` means the path does not currently exist as a
    /// directory, which is an expected state for chain levels.
    ///
    /// Lock order is `watches` then `registry`, and the `watches` lock is
    /// held across both the kernel add and the sink insertion so a
    /// concurrent last-registration removal cannot retire a descriptor
    /// between the two.
    fn add_watch(
        &self,
        path: &Path,
        shared: &Arc<Shared>,
    ) -> io::Result<Option<WatchDescriptor>> {
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(io::Error::other("inotify reader has shut down"));
        }
        let mut watches = self.watches.lock();
        let wd = match watches.add(path, watch_mask()) {
            Ok(wd) => wd,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::NotADirectory
                ) =>
            {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let mut registry = self.registry.lock();
        let sinks = registry.entry(wd.clone()).or_default();
        if let Some(sink) = sinks.iter_mut().find(|sink| sink.watcher_id == shared.id) {
            sink.refs += 1;
        } else {
            sinks.push(Sink {
                watcher_id: shared.id,
                refs: 1,
                shared: Arc::downgrade(shared),
            });
        }
        Ok(Some(wd))
    }

    /// Drops one watcher's registration against `wd`, removing the kernel
    /// watch when no registrations remain.
    ///
    /// The `watches` lock is taken first and held through the kernel
    /// remove. A concurrent `add_watch` on the same directory therefore
    /// either completes before the emptiness check (and keeps the
    /// descriptor alive) or starts after the kernel watch is gone (and
    /// gets a fresh descriptor); it can never be handed a descriptor this
    /// call is about to retire.
    fn remove_watch(&self, wd: &WatchDescriptor, watcher_id: usize) {
        let mut watches = self.watches.lock();
        let mut registry = self.registry.lock();
        let Some(sinks) = registry.get_mut(wd) else {
            return;
        };
        if let Some(pos) = sinks.iter().position(|sink| sink.watcher_id == watcher_id) {
            sinks[pos].refs -= 1;
            if sinks[pos].refs == 0 {
                sinks.swap_remove(pos);
            }
        }
        if !sinks.is_empty() {
            return;
        }
        registry.remove(wd);
        drop(registry);
        // EINVAL here means the kernel already retired the descriptor
        // because the watched directory was deleted.
        if let Err(err) = watches.remove(wd.clone()) {
            trace!(error = %err, "inotify watch already gone");
        }
    }

    /// `false` once the reader thread has died; the instance is
    /// permanently unusable and must not be handed to new watches.
    fn usable(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Fails every registered watcher after an unrecoverable read error.
    /// Each one gets a single error notification on its own runner.
    fn poison(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        let sinks: Vec<Sink> = {
            let mut registry = self.registry.lock();
            registry.drain().flat_map(|(_, sinks)| sinks).collect()
        };
        let mut watchers: FxHashMap<usize, Arc<Shared>> = FxHashMap::default();
        for sink in sinks {
            if let Some(shared) = sink.shared.upgrade() {
                watchers.entry(sink.watcher_id).or_insert(shared);
            }
        }
        for shared in watchers.into_values() {
            let task_target = Arc::clone(&shared);
            shared.runner.post(move || task_target.on_backend_failure());
        }
    }
}

/// State shared between the watcher handle, queued runner tasks, and the
/// reader's registration table. Mutated only under the state mutex, and
/// only by tasks running on the owning runner (plus teardown).
struct Shared {
    id: usize,
    runner: TaskRunner,
    reader: Arc<InotifyReader>,
    cancelled: AtomicBool,
    state: Mutex<State>,
}

struct State {
    target: PathBuf,
    recursive: bool,
    chain: WatchChain<WatchDescriptor>,
    /// Descendant directories of a recursive watch, keyed by path. The
    /// component-wise `PathBuf` ordering keeps each subtree contiguous, so
    /// subtree maintenance is a range scan.
    recursive_by_path: BTreeMap<PathBuf, WatchDescriptor>,
    recursive_by_wd: FxHashMap<WatchDescriptor, PathBuf>,
    /// Taken out for the duration of a callback invocation; `None` also
    /// encodes "dead" after an error event or cancellation.
    callback: Option<ChangeCallback>,
}

impl Shared {
    /// Rebuilds the component chain from the filesystem root down,
    /// installing a watch per existing level and releasing handles the new
    /// walk no longer needs. Levels below the first missing component stay
    /// unwatched until an ancestor event triggers the next rebuild.
    fn update_watches(self: &Arc<Self>, state: &mut State) {
        debug_assert!(self.runner.belongs_to_current_thread());
        debug_assert!(chain::is_valid(&state.chain));

        let mut path = chain::watch_root(&state.target);
        let mut blocked = false;

        for index in 0..state.chain.len() {
            let mut next = ChainEntry::new(state.chain[index].subdir.clone());

            if !blocked {
                match self.reader.add_watch(&path, self) {
                    Ok(Some(wd)) => next.watch = Some(wd),
                    Ok(None) => {
                        // The level is missing or not a directory. A symlink
                        // whose target does not exist yet can still be
                        // covered by watching the target's parent.
                        if let Some((link_parent, link_name)) = symlink_watch_point(&path)
                            && let Ok(Some(wd)) = self.reader.add_watch(&link_parent, self)
                        {
                            trace!(link = %path.display(), "watching through symlink parent");
                            next.watch = Some(wd);
                            next.link_target = Some(link_name);
                        }
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "failed to install component watch");
                    }
                }
                blocked = next.watch.is_none();
            }

            // The new registration (if any) is already counted, so releasing
            // the old one here can never drop a descriptor both still share.
            let old = std::mem::replace(&mut state.chain[index], next);
            if let Some(old_wd) = old.watch {
                self.reader.remove_watch(&old_wd, self.id);
            }

            if !state.chain[index].subdir.is_empty() {
                path.push(&state.chain[index].subdir);
            }
        }
    }

    /// Brings the recursive descendant index back in line with the
    /// filesystem. `fired` scopes the refresh to one subtree when the
    /// triggering event came from a descendant watch; otherwise the whole
    /// target subtree is re-walked.
    fn update_recursive_watches(self: &Arc<Self>, state: &mut State, fired: Option<&WatchDescriptor>) {
        if !state.recursive {
            return;
        }
        if state.chain.last().is_none_or(|entry| entry.watch.is_none()) {
            // The target itself is gone or unwatchable; the subtree index
            // goes with it and is rebuilt from scratch on reappearance.
            self.clear_recursive_watches(state);
            return;
        }
        let root = fired
            .and_then(|wd| state.recursive_by_wd.get(wd))
            .cloned()
            .unwrap_or_else(|| state.target.clone());
        self.refresh_recursive_subtree(state, &root);
    }

    fn refresh_recursive_subtree(self: &Arc<Self>, state: &mut State, root: &Path) {
        let stale: Vec<PathBuf> = state
            .recursive_by_path
            .range(root.to_path_buf()..)
            .take_while(|(path, _)| path.starts_with(root))
            .map(|(path, _)| path.clone())
            .filter(|path| !path.is_dir())
            .collect();
        for path in stale {
            if let Some(wd) = state.recursive_by_path.remove(&path) {
                state.recursive_by_wd.remove(&wd);
                self.reader.remove_watch(&wd, self.id);
            }
        }

        if !root.is_dir() {
            return;
        }
        let missing: Vec<PathBuf> = subdirectories(root)
            .filter(|dir| !state.recursive_by_path.contains_key(dir))
            .collect();
        for dir in missing {
            match self.reader.add_watch(&dir, self) {
                Ok(Some(wd)) => {
                    state.recursive_by_wd.insert(wd.clone(), dir.clone());
                    state.recursive_by_path.insert(dir, wd);
                }
                // The directory raced away between enumeration and watch.
                Ok(None) => {}
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "failed to install recursive watch");
                }
            }
        }
    }

    fn clear_recursive_watches(&self, state: &mut State) {
        for (_, wd) in std::mem::take(&mut state.recursive_by_path) {
            self.reader.remove_watch(&wd, self.id);
        }
        state.recursive_by_wd.clear();
    }

    /// Classifies one raw inotify event against the chain and the recursive
    /// index, rebuilds whatever the event invalidated, and delivers at most
    /// one notification.
    fn on_change(
        self: &Arc<Self>,
        fired: &WatchDescriptor,
        child: &OsStr,
        created: bool,
        deleted: bool,
        is_directory: bool,
    ) {
        debug_assert!(self.runner.belongs_to_current_thread());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock();
        if state.callback.is_none() {
            return;
        }

        // Events from descendant watches of a recursive target always
        // concern the target's subtree.
        if state.recursive_by_wd.contains_key(fired) {
            if is_directory && (created || deleted) {
                self.update_recursive_watches(&mut state, Some(fired));
            }
            self.deliver(state, false);
            return;
        }

        // A descriptor can back several chain levels (symlinks watched
        // through a shared parent), so every matching entry contributes.
        let mut matched = false;
        let mut on_target_path = false;
        let mut target_changed = false;
        let len = state.chain.len();
        for (index, entry) in state.chain.iter().enumerate() {
            if entry.watch.as_ref() != Some(fired) {
                continue;
            }
            matched = true;

            on_target_path |= child.is_empty()
                || entry.link_target.as_deref() == Some(child)
                || child == entry.subdir.as_os_str();

            if index + 1 == len {
                // The watch on the target itself. A linkname restricts it to
                // events about the link's referent.
                target_changed |= entry
                    .link_target
                    .as_deref()
                    .is_none_or(|link| link == child);
            } else if index + 2 == len && child == entry.subdir.as_os_str() {
                // The target's parent saw the target's own name change.
                target_changed = true;
            }
        }
        if !matched {
            return;
        }

        if on_target_path && (created || deleted) {
            self.update_watches(&mut state);
            self.update_recursive_watches(&mut state, None);
        } else if is_directory && (created || deleted) {
            self.update_recursive_watches(&mut state, Some(fired));
        }

        if target_changed || (on_target_path && (created || deleted)) {
            self.deliver(state, false);
        }
    }

    /// Invoked (via posted task) when the reader thread dies. Delivers the
    /// terminal error notification; the watch is dead afterwards.
    fn on_backend_failure(self: &Arc<Self>) {
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let state = self.state.lock();
        self.deliver(state, true);
    }

    /// Delivers one notification with the state lock released, so the
    /// callback may call back into the watcher (including cancelling it).
    /// The callback slot is restored afterwards unless the watch died.
    fn deliver(self: &Arc<Self>, mut state: MutexGuard<'_, State>, error: bool) {
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

    /// Releases everything registered with the reader and drops the
    /// callback. Runs on the owning runner, except when the runner is
    /// already gone and no task can race us.
    fn teardown(&self) {
        let mut state = self.state.lock();
        state.callback = None;
        for entry in &mut state.chain {
            if let Some(wd) = entry.watch.take() {
                self.reader.remove_watch(&wd, self.id);
            }
        }
        self.clear_recursive_watches(&mut state);
        debug!(target = %state.target.display(), "watch torn down");
    }
}

/// Watches the final component of the symlink's referent through the
/// referent's parent directory. Relative referents resolve against the
/// link's own parent.
fn symlink_watch_point(link: &Path) -> Option<(PathBuf, OsString)> {
    let referent = std::fs::read_link(link).ok()?;
    let referent = if referent.is_absolute() {
        referent
    } else {
        link.parent()?.join(referent)
    };
    let name = referent.file_name()?.to_owned();
    let parent = referent.parent()?.to_path_buf();
    Some((parent, name))
}

/// A single established inotify-backed watch. Cancelled explicitly or on
/// drop; cancellation is thread-safe and idempotent.
pub(crate) struct InotifyWatcher {
    shared: Arc<Shared>,
}

impl InotifyWatcher {
    /// Establishes the watch. Must run on `runner`; the initial chain walk
    /// happens synchronously, so by the time this returns every currently
    /// existing level is covered.
    pub(crate) fn watch(
        runner: TaskRunner,
        reader: Arc<InotifyReader>,
        target: &Path,
        recursive: bool,
        callback: ChangeCallback,
    ) -> Self {
        debug_assert!(runner.belongs_to_current_thread());
        let shared = Arc::new(Shared {
            id: NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed),
            runner,
            reader,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(State {
                target: target.to_path_buf(),
                recursive,
                chain: chain::build(target),
                recursive_by_path: BTreeMap::new(),
                recursive_by_wd: FxHashMap::default(),
                callback: Some(callback),
            }),
        });
        {
            let mut state = shared.state.lock();
            shared.update_watches(&mut state);
            shared.update_recursive_watches(&mut state, None);
        }
        debug!(target = %target.display(), recursive, "watch established");
        Self { shared }
    }

    /// Stops the watch. After this returns on the owning runner thread, the
    /// callback will not run again; from other threads, teardown is posted
    /// and any still-queued event tasks see the cancelled flag first.
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
            // Runner already shut down, so no task can be delivering; safe
            // to release kernel state from here.
            self.shared.teardown();
        }
    }
}

impl Drop for InotifyWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
impl InotifyWatcher {
    fn chain_watch_flags(&self) -> Vec<bool> {
        self.shared
            .state
            .lock()
            .chain
            .iter()
            .map(|entry| entry.watch.is_some())
            .collect()
    }

    fn recursive_paths(&self) -> Vec<PathBuf> {
        self.shared
            .state
            .lock()
            .recursive_by_path
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);
    const QUIET_TIMEOUT: Duration = Duration::from_millis(500);

    fn start_watch(
        runner: &TaskRunner,
        target: &Path,
        recursive: bool,
    ) -> (InotifyWatcher, mpsc::Receiver<ChangeEvent>) {
        let (tx, rx) = mpsc::channel();
        let watcher = runner
            .post_and_wait({
                let runner = runner.clone();
                let target = target.to_path_buf();
                move || {
                    let reader = shared_reader().unwrap();
                    InotifyWatcher::watch(
                        runner,
                        reader,
                        &target,
                        recursive,
                        Box::new(move |event| {
                            let _ = tx.send(event);
                        }),
                    )
                }
            })
            .unwrap();
        (watcher, rx)
    }

    fn expect_event(rx: &mpsc::Receiver<ChangeEvent>) -> ChangeEvent {
        rx.recv_timeout(EVENT_TIMEOUT).unwrap()
    }

    fn expect_quiet(rx: &mpsc::Receiver<ChangeEvent>) {
        assert!(rx.recv_timeout(QUIET_TIMEOUT).is_err());
    }

    fn drain(rx: &mpsc::Receiver<ChangeEvent>) {
        while rx.recv_timeout(QUIET_TIMEOUT).is_ok() {}
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + EVENT_TIMEOUT;
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_create_is_detected() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("fresh.txt");

        let (_watcher, rx) = start_watch(&runner, &target, false);
        fs::write(&target, b"hello").unwrap();

        let event = expect_event(&rx);
        assert_eq!(event.path, target);
        assert!(!event.error);
    }

    #[test]
    fn test_modify_is_detected() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("config.json");
        fs::write(&target, b"{}").unwrap();

        let (_watcher, rx) = start_watch(&runner, &target, false);
        fs::write(&target, b"{\"key\":1}").unwrap();

        let event = expect_event(&rx);
        assert_eq!(event.path, target);
        assert!(!event.error);
    }

    #[test]
    fn test_delete_then_recreate_is_detected() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("volatile.txt");
        fs::write(&target, b"x").unwrap();

        let (_watcher, rx) = start_watch(&runner, &target, false);

        fs::remove_file(&target).unwrap();
        assert!(!expect_event(&rx).error);
        drain(&rx);

        fs::write(&target, b"y").unwrap();
        assert!(!expect_event(&rx).error);
    }

    #[test]
    fn test_chain_reanchors_as_ancestors_appear() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("build").join("out").join("log.txt");

        let (watcher, rx) = start_watch(&runner, &target, false);

        // Nothing below the temp dir exists yet, so the last three levels
        // (build, out, the target itself) carry no handle.
        let flags = watcher.chain_watch_flags();
        let n = flags.len();
        assert!(flags[n - 4]);
        assert!(!flags[n - 3] && !flags[n - 2] && !flags[n - 1]);

        fs::create_dir(tmp.path().join("build")).unwrap();
        assert!(!expect_event(&rx).error);
        let flags = watcher.chain_watch_flags();
        assert!(flags[n - 3]);
        assert!(!flags[n - 2]);

        fs::create_dir(tmp.path().join("build").join("out")).unwrap();
        assert!(!expect_event(&rx).error);
        let flags = watcher.chain_watch_flags();
        assert!(flags[n - 2]);

        fs::write(&target, b"ok").unwrap();
        assert!(!expect_event(&rx).error);
        // A regular file never carries its own directory handle.
        assert!(!watcher.chain_watch_flags()[n - 1]);
    }

    #[test]
    fn test_sibling_changes_are_ignored() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("watched.txt");
        fs::write(&target, b"x").unwrap();

        let (_watcher, rx) = start_watch(&runner, &target, false);
        fs::write(tmp.path().join("unrelated.txt"), b"noise").unwrap();

        expect_quiet(&rx);
    }

    #[test]
    fn test_directory_watch_reports_child_changes() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("inbox");
        fs::create_dir(&dir).unwrap();

        let (_watcher, rx) = start_watch(&runner, &dir, false);
        fs::write(dir.join("mail-1"), b"...").unwrap();

        let event = expect_event(&rx);
        assert_eq!(event.path, dir);
    }

    #[test]
    fn test_recursive_watch_tracks_new_subtrees() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();

        let (watcher, rx) = start_watch(&runner, &root, true);
        assert!(watcher.recursive_paths().is_empty());

        fs::create_dir(root.join("a")).unwrap();
        assert!(!expect_event(&rx).error);
        assert_eq!(watcher.recursive_paths(), vec![root.join("a")]);
        drain(&rx);

        fs::create_dir(root.join("a").join("b")).unwrap();
        assert!(!expect_event(&rx).error);
        assert_eq!(
            watcher.recursive_paths(),
            vec![root.join("a"), root.join("a").join("b")]
        );
        drain(&rx);

        // A write deep in the tree reports the watch target, not the file.
        fs::write(root.join("a").join("b").join("data.bin"), b"x").unwrap();
        let event = expect_event(&rx);
        assert_eq!(event.path, root);
    }

    #[test]
    fn test_recursive_watch_picks_up_tree_created_at_once() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();

        let (watcher, rx) = start_watch(&runner, &root, true);
        fs::create_dir_all(root.join("a").join("b").join("c")).unwrap();

        assert!(!expect_event(&rx).error);
        // Rescans race the nested creation; whichever creations each
        // rescan saw, the index converges on the whole tree.
        wait_until(|| {
            let paths = watcher.recursive_paths();
            paths.contains(&root.join("a"))
                && paths.contains(&root.join("a").join("b"))
                && paths.contains(&root.join("a").join("b").join("c"))
        });
    }

    #[test]
    fn test_recursive_index_empties_when_target_vanishes() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir_all(root.join("sub")).unwrap();

        let (watcher, rx) = start_watch(&runner, &root, true);
        assert_eq!(watcher.recursive_paths(), vec![root.join("sub")]);

        fs::remove_dir_all(&root).unwrap();
        assert!(!expect_event(&rx).error);
        wait_until(|| watcher.recursive_paths().is_empty());
        drain(&rx);
    }

    #[test]
    fn test_broken_symlink_fires_when_referent_appears() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let referent = tmp.path().join("real.txt");
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(&referent, &link).unwrap();

        let (_watcher, rx) = start_watch(&runner, &link, false);
        fs::write(&referent, b"now it exists").unwrap();

        let event = expect_event(&rx);
        assert_eq!(event.path, link);
    }

    #[test]
    fn test_cancel_stops_delivery() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("stop.txt");
        fs::write(&target, b"x").unwrap();

        let (watcher, rx) = start_watch(&runner, &target, false);
        watcher.cancel();
        // Flush the posted teardown before touching the file.
        runner.post_and_wait(|| ()).unwrap();

        fs::write(&target, b"y").unwrap();
        expect_quiet(&rx);
    }

    #[test]
    fn test_shared_directory_watch_survives_peer_cancel() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let first = tmp.path().join("first.txt");
        let second = tmp.path().join("second.txt");
        fs::write(&first, b"x").unwrap();
        fs::write(&second, b"x").unwrap();

        // Both chains register against the same kernel watch on the
        // shared parent directory.
        let (one, _rx_one) = start_watch(&runner, &first, false);
        let (two, rx_two) = start_watch(&runner, &second, false);

        one.cancel();
        runner.post_and_wait(|| ()).unwrap();

        // The surviving registration must keep the descriptor alive.
        fs::write(&second, b"y").unwrap();
        let event = expect_event(&rx_two);
        assert_eq!(event.path, second);
        drop(two);
    }

    #[test]
    fn test_dead_reader_fails_watch_and_rejects_new_registrations() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("orphaned.txt");
        fs::write(&target, b"x").unwrap();

        let reader = InotifyReader::spawn().unwrap();
        let (tx, rx) = mpsc::channel();
        let watcher = runner
            .post_and_wait({
                let runner = runner.clone();
                let reader = Arc::clone(&reader);
                let target = target.clone();
                move || {
                    InotifyWatcher::watch(
                        runner,
                        reader,
                        &target,
                        false,
                        Box::new(move |event| {
                            let _ = tx.send(event);
                        }),
                    )
                }
            })
            .unwrap();

        reader.poison();
        let event = expect_event(&rx);
        assert_eq!(event.path, target);
        assert!(event.error);

        // The dead instance is no longer usable: it must not be handed to
        // new watches, and direct registrations fail outright.
        assert!(!reader.usable());
        assert!(reader.add_watch(tmp.path(), &watcher.shared).is_err());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("twice.txt");

        let (watcher, _rx) = start_watch(&runner, &target, false);
        watcher.cancel();
        watcher.cancel();
        drop(watcher);
    }

    #[test]
    fn test_backend_failure_delivers_exactly_one_error() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("doomed.txt");
        fs::write(&target, b"x").unwrap();

        let (watcher, rx) = start_watch(&runner, &target, false);
        for _ in 0..2 {
            runner
                .post_and_wait({
                    let shared = Arc::clone(&watcher.shared);
                    move || shared.on_backend_failure()
                })
                .unwrap();
        }

        let event = expect_event(&rx);
        assert_eq!(event.path, target);
        assert!(event.error);
        expect_quiet(&rx);
    }

    #[test]
    fn test_one_raw_event_yields_at_most_one_callback() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("single.txt");
        fs::write(&target, b"x").unwrap();

        let (watcher, rx) = start_watch(&runner, &target, false);
        let parent_wd = {
            let state = watcher.shared.state.lock();
            state.chain[state.chain.len() - 2].watch.clone().unwrap()
        };

        runner
            .post_and_wait({
                let shared = Arc::clone(&watcher.shared);
                move || shared.on_change(&parent_wd, OsStr::new("single.txt"), false, false, false)
            })
            .unwrap();

        assert!(!expect_event(&rx).error);
        expect_quiet(&rx);
    }

    #[test]
    fn test_callback_may_cancel_its_own_watch() {
        let runner = TaskRunner::new("inotify-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("self-stop.txt");
        fs::write(&target, b"x").unwrap();

        let (tx, rx) = mpsc::channel();
        let watcher = Arc::new(Mutex::new(None::<InotifyWatcher>));
        let created = runner
            .post_and_wait({
                let runner = runner.clone();
                let target = target.clone();
                let slot = Arc::clone(&watcher);
                move || {
                    let reader = shared_reader().unwrap();
                    let inner = Arc::clone(&slot);
                    let w = InotifyWatcher::watch(
                        runner,
                        reader,
                        &target,
                        false,
                        Box::new(move |event| {
                            if let Some(w) = inner.lock().as_ref() {
                                w.cancel();
                            }
                            let _ = tx.send(event);
                        }),
                    );
                    *slot.lock() = Some(w);
                }
            });
        created.unwrap();

        fs::write(&target, b"y").unwrap();
        assert!(!expect_event(&rx).error);
        expect_quiet(&rx);
    }
}
