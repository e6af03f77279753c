//! Windows backend built on directory change-notification handles.
//!
//! `FindFirstChangeNotificationW` watches one directory (optionally a whole
//! subtree) but cannot watch a path that does not exist, so the handle is
//! installed on the most specific existing ancestor of the target: walk up
//! until a handle sticks, then re-check downward in case a component was
//! created concurrently. Whenever the target's existence flips, the handle
//! is re-anchored.
//!
//! Change handles carry no detail about what changed. Delivery is decided
//! by probing the target: an existence flip always notifies, a new
//! modification time notifies, and an unchanged modification time notifies
//! only within [`MODIFY_SUPPRESSION_WINDOW`] of the first sighting, since
//! FILETIME resolution can hide back-to-back writes inside the same tick.
//!
//! Each installed handle is serviced by its own wait thread, which owns the
//! handle plus a per-generation stop event and closes both on exit. The
//! runner only ever signals the stop event, so handle lifetime is never
//! shared across threads.

use std::io;
use std::os::windows::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use windows_sys::Win32::Foundation::{
    CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME,
    FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
    FindCloseChangeNotification, FindFirstChangeNotificationW, FindNextChangeNotification,
};
use windows_sys::Win32::System::Threading::{CreateEventW, INFINITE, SetEvent, WaitForMultipleObjects};

use pathwatch_core::TaskRunner;

use crate::error::WatchError;
use crate::event::{ChangeCallback, ChangeEvent};

/// How long repeated signals with an unchanged modification time keep
/// notifying after the first sighting of that timestamp. A tunable, not a
/// contract: it papers over FILETIME's one-second-ish resolution, under
/// which a second write inside the same tick is indistinguishable from an
/// unrelated wakeup.
pub(crate) const MODIFY_SUPPRESSION_WINDOW: Duration = Duration::from_secs(1);

/// Raw Win32 handle that may cross threads.
#[derive(Clone, Copy)]
struct RawHandle(HANDLE);

unsafe impl Send for RawHandle {}

fn create_change_handle(path: &Path, recursive: bool) -> io::Result<RawHandle> {
    let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
    let flags = FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_ATTRIBUTES
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
        | FILE_NOTIFY_CHANGE_SECURITY;
    let handle =
        unsafe { FindFirstChangeNotificationW(wide.as_ptr(), i32::from(recursive), flags) };
    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        Ok(RawHandle(handle))
    }
}

/// Installs a change handle on the most specific existing ancestor of
/// `target` (or `target` itself). The downward re-check guards against a
/// component being created between the failed probe and the successful
/// ancestor registration.
fn setup_watch_handle(target: &Path, recursive: bool) -> io::Result<(RawHandle, PathBuf)> {
    loop {
        let mut path = target.to_path_buf();
        let handle = loop {
            match create_change_handle(&path, recursive) {
                Ok(handle) => break handle,
                Err(err) => match path.parent() {
                    Some(parent) => {
                        trace!(path = %path.display(), error = %err, "walking up for change handle");
                        path = parent.to_path_buf();
                    }
                    None => return Err(err),
                },
            }
        };
        if path == target {
            return Ok((handle, path));
        }
        // The child component below the watched ancestor did not exist a
        // moment ago; if it does now, a deeper anchor is available.
        let child = next_component_below(&path, target);
        if child.as_ref().is_some_and(|c| c.exists()) {
            unsafe {
                FindCloseChangeNotification(handle.0);
            }
            continue;
        }
        return Ok((handle, path));
    }
}

/// Returns `ancestor` extended by the next component of `target`.
fn next_component_below(ancestor: &Path, target: &Path) -> Option<PathBuf> {
    let rest = target.strip_prefix(ancestor).ok()?;
    let first = rest.components().next()?;
    Some(ancestor.join(first.as_os_str()))
}

struct WinShared {
    runner: TaskRunner,
    cancelled: AtomicBool,
    state: Mutex<WinState>,
}

struct WinState {
    target: PathBuf,
    recursive: bool,
    /// The directory the current change handle is anchored on.
    watched: PathBuf,
    /// Stop event of the current wait-thread generation; signalling it
    /// retires the thread, which closes its own handles.
    generation_stop: Option<RawHandle>,
    /// Last observed modification time; `None` doubles as "target absent".
    last_modified: Option<SystemTime>,
    /// When `last_modified` was first reported, for the suppression window.
    first_notification: Option<Instant>,
    callback: Option<ChangeCallback>,
}

impl WinShared {
    /// Installs (or re-anchors) the change handle and its wait thread.
    fn arm(self: &Arc<Self>, state: &mut WinState) -> io::Result<()> {
        if let Some(stop) = state.generation_stop.take() {
            unsafe {
                SetEvent(stop.0);
            }
        }
        let (handle, watched) = setup_watch_handle(&state.target, state.recursive)?;
        let stop = unsafe { CreateEventW(std::ptr::null(), 1, 0, std::ptr::null()) };
        if stop.is_null() {
            unsafe {
                FindCloseChangeNotification(handle.0);
            }
            return Err(io::Error::last_os_error());
        }
        let stop = RawHandle(stop);
        spawn_wait_thread(Arc::clone(self), handle, stop)?;
        state.generation_stop = Some(stop);
        state.watched = watched;
        trace!(anchor = %state.watched.display(), "change handle anchored");
        Ok(())
    }

    /// Posted by the wait thread for every handle signal.
    fn on_signal(self: &Arc<Self>) {
        debug_assert!(self.runner.belongs_to_current_thread());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return;
        }

        let modified = std::fs::metadata(&state.target)
            .and_then(|meta| meta.modified())
            .ok();
        let existed = state.last_modified.is_some();
        let exists = modified.is_some();

        // Existence flips move the most specific existing ancestor, so the
        // handle has to be re-anchored before anything else.
        if exists != existed
            && let Err(err) = self.arm(&mut state)
        {
            error!(error = %err, "failed to re-anchor change handle");
            self.deliver(state, true);
            return;
        }

        if state.recursive {
            // Subtree mode has no single timestamp to compare; every signal
            // for an existing target is a change somewhere beneath it.
            if exists || existed {
                self.deliver(state, false);
            }
            return;
        }

        match (modified, state.last_modified) {
            (Some(now), Some(prev)) if now == prev => {
                // Same timestamp as on record: either an unrelated wakeup or
                // a write hidden inside the timestamp tick. Forward it only
                // while inside the suppression window of the first sighting.
                if let Some(first) = state.first_notification {
                    if first.elapsed() > MODIFY_SUPPRESSION_WINDOW {
                        state.first_notification = None;
                    } else {
                        self.deliver(state, false);
                    }
                }
            }
            (Some(now), _) => {
                state.last_modified = Some(now);
                state.first_notification = Some(Instant::now());
                self.deliver(state, false);
            }
            (None, Some(_)) => {
                state.last_modified = None;
                state.first_notification = None;
                self.deliver(state, false);
            }
            (None, None) => {}
        }
    }

    fn deliver(self: &Arc<Self>, mut state: MutexGuard<'_, WinState>, error: bool) {
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
        state.callback = None;
        if let Some(stop) = state.generation_stop.take() {
            unsafe {
                SetEvent(stop.0);
            }
        }
        debug!(target = %state.target.display(), "change-handle watch torn down");
    }
}

/// Waits on the change handle until the generation stop event fires or the
/// notification cannot be re-armed. Owns and closes both handles.
fn spawn_wait_thread(shared: Arc<WinShared>, handle: RawHandle, stop: RawHandle) -> io::Result<()> {
    thread::Builder::new()
        .name("pathwatch change-handle wait".into())
        .spawn(move || {
            let handles = [stop.0, handle.0];
            loop {
                let status =
                    unsafe { WaitForMultipleObjects(2, handles.as_ptr(), 0, INFINITE) };
                if status != WAIT_OBJECT_0 + 1 {
                    break;
                }
                if unsafe { FindNextChangeNotification(handle.0) } == 0 {
                    warn!("failed to re-arm change notification");
                    break;
                }
                let task_target = Arc::clone(&shared);
                if !shared.runner.post(move || task_target.on_signal()) {
                    break;
                }
            }
            unsafe {
                FindCloseChangeNotification(handle.0);
                CloseHandle(stop.0);
            }
        })?;
    Ok(())
}

/// A change-notification-handle backed watch (recursive or not).
pub(crate) struct ChangeHandleWatcher {
    shared: Arc<WinShared>,
}

impl ChangeHandleWatcher {
    pub(crate) fn watch(
        runner: TaskRunner,
        target: &Path,
        recursive: bool,
        callback: ChangeCallback,
    ) -> Result<Self, WatchError> {
        debug_assert!(runner.belongs_to_current_thread());
        let last_modified = std::fs::metadata(target)
            .and_then(|meta| meta.modified())
            .ok();
        let shared = Arc::new(WinShared {
            runner,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(WinState {
                target: target.to_path_buf(),
                recursive,
                watched: PathBuf::new(),
                generation_stop: None,
                last_modified,
                first_notification: None,
                callback: Some(callback),
            }),
        });
        {
            let mut state = shared.state.lock();
            shared.arm(&mut state)?;
        }
        debug!(target = %target.display(), recursive, "change-handle watch established");
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

impl Drop for ChangeHandleWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
