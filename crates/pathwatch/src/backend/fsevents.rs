//! macOS recursive backend built on the FSEvents API.
//!
//! FSEvents natively covers a whole subtree, so there is no per-component
//! chain here: one stream is created on the (symlink-resolved) target with
//! `WatchRoot`, and the kernel reports both subtree changes and changes to
//! the path of the root itself. A `RootChanged` event means the target was
//! moved, deleted, or re-created; the stream does not follow it, so we tear
//! the stream down, re-resolve the target, and start a fresh one.
//!
//! The stream is serviced by a dedicated CFRunLoop thread. Its callback
//! only posts tasks to the owning runner; all state lives behind the state
//! mutex and is touched on the runner alone.

use std::ffi::{CStr, OsStr, c_void};
use std::io;
use std::os::raw::c_char;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread;

use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, trace, warn};

use pathwatch_core::TaskRunner;

use crate::error::WatchError;
use crate::event::{ChangeCallback, ChangeEvent};

/// Bound on symlink hops when resolving the stream root. A chain longer
/// than this is treated as unresolvable and the last path wins.
const MAX_SYMLINK_HOPS: usize = 255;

const STREAM_LATENCY_SECONDS: cf::CFTimeInterval = 0.01;

/// Follows symlinks from `target` up to [`MAX_SYMLINK_HOPS`] times.
///
/// Unlike `canonicalize`, this works for paths that do not exist yet: the
/// first non-link (or missing) path is returned as-is.
fn resolve_stream_root(target: &Path) -> PathBuf {
    let mut resolved = target.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        let Ok(referent) = std::fs::read_link(&resolved) else {
            return resolved;
        };
        resolved = if referent.is_absolute() {
            referent
        } else {
            match resolved.parent() {
                Some(parent) => parent.join(referent),
                None => referent,
            }
        };
    }
    warn!(target = %target.display(), "symlink chain exceeds hop limit");
    resolved
}

/// Context handed to the C callback. Owned by the stream; freed by
/// `release_context` when the stream is released.
struct ContextInfo {
    shared: Weak<FsShared>,
}

extern "C" fn release_context(info: *const c_void) {
    // FSEvents only calls this once, when the stream is deallocated.
    unsafe {
        drop(Box::from_raw(info.cast::<ContextInfo>().cast_mut()));
    }
}

extern "C" fn stream_callback(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    _event_ids: *const fs::FSEventStreamEventId,
) {
    // Must not panic: unwinding across the FFI boundary is undefined.
    let info = info.cast::<ContextInfo>();
    let Some(shared) = (unsafe { (*info).shared.upgrade() }) else {
        return;
    };
    let paths = event_paths.cast::<*const c_char>();

    for index in 0..num_events {
        let raw = unsafe { CStr::from_ptr(*paths.add(index)) };
        let path = PathBuf::from(OsStr::from_bytes(raw.to_bytes()));
        let flags = unsafe { *event_flags.add(index) };

        let root_changed = flags & fs::kFSEventStreamEventFlagRootChanged != 0;
        if flags & fs::kFSEventStreamEventFlagMustScanSubDirs != 0 {
            warn!(path = %path.display(), "fsevents dropped events, subtree must be rescanned");
        }

        let task_target = Arc::clone(&shared);
        shared.runner.post(move || {
            if root_changed {
                task_target.on_root_changed();
            } else {
                task_target.on_stream_event(&path);
            }
        });
    }
}

/// A live stream plus the run loop servicing it. Stopping the run loop
/// makes the service thread fall through to stream teardown.
struct StreamHandle {
    runloop: cf::CFRunLoopRef,
}

// CFRunLoopRef may be stopped from any thread.
unsafe impl Send for StreamHandle {}

impl StreamHandle {
    fn stop(&self) {
        unsafe {
            cf::CFRunLoopStop(self.runloop);
        }
    }
}

struct FsShared {
    runner: TaskRunner,
    cancelled: AtomicBool,
    state: Mutex<FsState>,
}

struct FsState {
    target: PathBuf,
    /// The symlink-resolved path the current stream was created on.
    resolved: PathBuf,
    stream: Option<StreamHandle>,
    callback: Option<ChangeCallback>,
}

impl FsShared {
    /// Creates and starts a stream on `resolved`, returning its handle.
    /// Runs the stream on a fresh named CFRunLoop thread; start failures
    /// surface synchronously through the handshake channel.
    fn start_stream(self: &Arc<Self>, resolved: &Path) -> io::Result<StreamHandle> {
        let str_path = resolved
            .to_str()
            .ok_or_else(|| io::Error::other("watch path is not valid UTF-8"))?
            .to_owned();

        let context_info = Box::into_raw(Box::new(ContextInfo {
            shared: Arc::downgrade(self),
        }));
        let context = fs::FSEventStreamContext {
            version: 0,
            info: context_info.cast::<c_void>(),
            retain: None,
            release: Some(release_context),
            copy_description: None,
        };

        let stream = unsafe {
            let paths =
                cf::CFArrayCreateMutable(cf::kCFAllocatorDefault, 0, &cf::kCFTypeArrayCallBacks);
            let mut err: cf::CFErrorRef = ptr::null_mut();
            let cf_path = cf::str_path_to_cfstring_ref(&str_path, &mut err);
            if cf_path.is_null() {
                if !err.is_null() {
                    cf::CFRelease(err.cast());
                }
                cf::CFRelease(paths.cast());
                drop(Box::from_raw(context_info));
                return Err(io::Error::other("failed to convert path to CFString"));
            }
            cf::CFArrayAppendValue(paths, cf_path.cast());
            cf::CFRelease(cf_path.cast());

            let stream = fs::FSEventStreamCreate(
                cf::kCFAllocatorDefault,
                stream_callback,
                &context,
                paths,
                fs::kFSEventStreamEventIdSinceNow,
                STREAM_LATENCY_SECONDS,
                fs::kFSEventStreamCreateFlagWatchRoot
                    | fs::kFSEventStreamCreateFlagNoDefer
                    | fs::kFSEventStreamCreateFlagFileEvents,
            );
            cf::CFRelease(paths.cast());
            stream
        };

        struct SendStream(fs::FSEventStreamRef);
        // CF objects may be moved across threads.
        unsafe impl Send for SendStream {}
        let stream = SendStream(stream);

        let (ready_tx, ready_rx) = mpsc::channel::<io::Result<StreamHandle>>();
        thread::Builder::new()
            .name("pathwatch fsevents loop".into())
            .spawn(move || {
                let stream = stream.0;
                unsafe {
                    let runloop = cf::CFRunLoopGetCurrent();
                    fs::FSEventStreamScheduleWithRunLoop(
                        stream,
                        runloop,
                        cf::kCFRunLoopDefaultMode,
                    );
                    if fs::FSEventStreamStart(stream) == 0 {
                        fs::FSEventStreamInvalidate(stream);
                        fs::FSEventStreamRelease(stream);
                        let _ = ready_tx.send(Err(io::Error::other(
                            "FSEventStreamStart failed",
                        )));
                        return;
                    }
                    let _ = ready_tx.send(Ok(StreamHandle { runloop }));

                    // Runs until StreamHandle::stop.
                    cf::CFRunLoopRun();
                    fs::FSEventStreamStop(stream);
                    fs::FSEventStreamInvalidate(stream);
                    fs::FSEventStreamRelease(stream);
                }
            })?;

        ready_rx
            .recv()
            .map_err(|_| io::Error::other("fsevents thread exited during startup"))?
    }

    /// Subtree event under the stream root. Everything the stream reports
    /// concerns the watched subtree, so classification reduces to a sanity
    /// check against the resolved root.
    fn on_stream_event(self: &Arc<Self>, path: &Path) {
        debug_assert!(self.runner.belongs_to_current_thread());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let state = self.state.lock();
        if path.starts_with(&state.resolved) || state.resolved.starts_with(path) {
            trace!(path = %path.display(), "fsevents change");
            self.deliver(state, false);
        }
    }

    /// The stream root itself moved, vanished, or reappeared. The old
    /// stream is dead either way; re-resolve and start over.
    fn on_root_changed(self: &Arc<Self>) {
        debug_assert!(self.runner.belongs_to_current_thread());
        if self.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return;
        }
        if let Some(old) = state.stream.take() {
            old.stop();
        }
        let resolved = resolve_stream_root(&state.target);
        debug!(resolved = %resolved.display(), "fsevents root changed, restarting stream");
        match self.start_stream(&resolved) {
            Ok(stream) => {
                state.resolved = resolved;
                state.stream = Some(stream);
                self.deliver(state, false);
            }
            Err(err) => {
                error!(error = %err, "failed to restart fsevents stream");
                self.deliver(state, true);
            }
        }
    }

    fn deliver(self: &Arc<Self>, mut state: MutexGuard<'_, FsState>, error: bool) {
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
        if let Some(stream) = state.stream.take() {
            stream.stop();
        }
        debug!(target = %state.target.display(), "fsevents watch torn down");
    }
}

/// A recursive FSEvents-backed watch.
pub(crate) struct FsEventsWatcher {
    shared: Arc<FsShared>,
}

impl FsEventsWatcher {
    pub(crate) fn watch(
        runner: TaskRunner,
        target: &Path,
        callback: ChangeCallback,
    ) -> Result<Self, WatchError> {
        debug_assert!(runner.belongs_to_current_thread());
        let resolved = resolve_stream_root(target);
        let shared = Arc::new(FsShared {
            runner,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(FsState {
                target: target.to_path_buf(),
                resolved: resolved.clone(),
                stream: None,
                callback: Some(callback),
            }),
        });
        let stream = shared.start_stream(&resolved)?;
        shared.state.lock().stream = Some(stream);
        debug!(target = %target.display(), "fsevents watch established");
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

impl Drop for FsEventsWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}
