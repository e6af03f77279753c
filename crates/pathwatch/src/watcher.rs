//! The public watching facade and per-platform backend selection.

use std::io;
use std::path::{Path, PathBuf};

use pathwatch_core::TaskRunner;
use tracing::debug;

use crate::error::WatchError;
use crate::event::ChangeEvent;

#[cfg(target_os = "macos")]
use crate::backend::fsevents::FsEventsWatcher;
#[cfg(target_os = "linux")]
use crate::backend::inotify::{self, InotifyWatcher};
#[cfg(target_os = "macos")]
use crate::backend::kqueue::KqueueWatcher;
#[cfg(windows)]
use crate::backend::windows::ChangeHandleWatcher;

/// Returns `true` if this platform can serve recursive watches.
///
/// Callers that need recursion should check before calling
/// [`PathWatcher::watch`] with `recursive = true`.
#[must_use]
pub const fn recursive_watch_available() -> bool {
    cfg!(any(target_os = "linux", target_os = "macos", windows))
}

/// The established platform backend behind a facade instance.
enum Backend {
    #[cfg(target_os = "linux")]
    Inotify(InotifyWatcher),
    #[cfg(target_os = "macos")]
    FsEvents(FsEventsWatcher),
    #[cfg(target_os = "macos")]
    Kqueue(KqueueWatcher),
    #[cfg(windows)]
    Windows(ChangeHandleWatcher),
}

impl Backend {
    fn cancel(&self) {
        match self {
            #[cfg(target_os = "linux")]
            Self::Inotify(watcher) => watcher.cancel(),
            #[cfg(target_os = "macos")]
            Self::FsEvents(watcher) => watcher.cancel(),
            #[cfg(target_os = "macos")]
            Self::Kqueue(watcher) => watcher.cancel(),
            #[cfg(windows)]
            Self::Windows(watcher) => watcher.cancel(),
        }
    }
}

/// Watches one filesystem path for changes.
///
/// A `PathWatcher` is created against the [`TaskRunner`] that will own it,
/// armed once with [`watch`](Self::watch), and torn down by
/// [`cancel`](Self::cancel) or by dropping it. The change callback runs
/// only on the owning runner, in the order the backend observed events.
///
/// See the crate-level docs for a usage example.
pub struct PathWatcher {
    runner: TaskRunner,
    backend: Option<Backend>,
    armed: bool,
}

impl PathWatcher {
    /// Creates an unarmed watcher owned by `runner`.
    #[must_use]
    pub const fn new(runner: TaskRunner) -> Self {
        Self {
            runner,
            backend: None,
            armed: false,
        }
    }

    /// Starts watching `path`, delivering a [`ChangeEvent`] to `callback`
    /// for every observed change. Relative paths resolve against the
    /// current directory at call time.
    ///
    /// Must be called on the owning runner, and at most once per instance.
    /// When `recursive` is set on a platform that cannot serve it, this
    /// fails with [`WatchError::RecursiveUnsupported`] without registering
    /// the callback, and the instance may be re-armed non-recursively.
    pub fn watch(
        &mut self,
        path: &Path,
        recursive: bool,
        callback: impl FnMut(ChangeEvent) + Send + 'static,
    ) -> Result<(), WatchError> {
        if !self.runner.belongs_to_current_thread() {
            return Err(WatchError::NotOnOwningRunner);
        }
        if self.armed {
            return Err(WatchError::AlreadyWatching);
        }
        if recursive && !recursive_watch_available() {
            return Err(WatchError::RecursiveUnsupported);
        }

        let target = absolutize(path)?;
        let backend = self.select_backend(&target, recursive, Box::new(callback))?;
        self.backend = Some(backend);
        self.armed = true;
        debug!(target = %target.display(), recursive, "path watch armed");
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn select_backend(
        &self,
        target: &Path,
        recursive: bool,
        callback: crate::event::ChangeCallback,
    ) -> Result<Backend, WatchError> {
        let reader = inotify::shared_reader()
            .ok_or_else(|| WatchError::Io(io::Error::other("inotify is unavailable")))?;
        Ok(Backend::Inotify(InotifyWatcher::watch(
            self.runner.clone(),
            reader,
            target,
            recursive,
            callback,
        )))
    }

    #[cfg(target_os = "macos")]
    fn select_backend(
        &self,
        target: &Path,
        recursive: bool,
        callback: crate::event::ChangeCallback,
    ) -> Result<Backend, WatchError> {
        if recursive {
            Ok(Backend::FsEvents(FsEventsWatcher::watch(
                self.runner.clone(),
                target,
                callback,
            )?))
        } else {
            Ok(Backend::Kqueue(KqueueWatcher::watch(
                self.runner.clone(),
                target,
                callback,
            )?))
        }
    }

    #[cfg(windows)]
    fn select_backend(
        &self,
        target: &Path,
        recursive: bool,
        callback: crate::event::ChangeCallback,
    ) -> Result<Backend, WatchError> {
        Ok(Backend::Windows(ChangeHandleWatcher::watch(
            self.runner.clone(),
            target,
            recursive,
            callback,
        )?))
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    fn select_backend(
        &self,
        _target: &Path,
        _recursive: bool,
        _callback: crate::event::ChangeCallback,
    ) -> Result<Backend, WatchError> {
        Err(WatchError::Io(io::Error::other(
            "no file watching backend for this platform",
        )))
    }

    /// Stops the watch. Idempotent, callable from any thread.
    ///
    /// When called off the owning runner, teardown is posted there and the
    /// backend state is kept alive by that task, so an in-flight event can
    /// never observe freed state. After `cancel` returns on the owning
    /// runner, the callback will not run again.
    pub fn cancel(&mut self) {
        if let Some(backend) = self.backend.take() {
            backend.cancel();
        }
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathWatcher")
            .field("runner", &self.runner)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

fn absolutize(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use std::time::Duration;

    const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_watch_off_runner_is_rejected() {
        let runner = TaskRunner::new("facade-test").unwrap();
        let mut watcher = PathWatcher::new(runner);
        let result = watcher.watch(Path::new("/tmp"), false, |_| {});
        assert!(matches!(result, Err(WatchError::NotOnOwningRunner)));
    }

    #[test]
    fn test_second_watch_is_rejected() {
        let runner = TaskRunner::new("facade-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("once.txt");

        let rejected = runner
            .post_and_wait({
                let runner = runner.clone();
                move || {
                    let mut watcher = PathWatcher::new(runner);
                    watcher.watch(&target, false, |_| {}).unwrap();
                    matches!(
                        watcher.watch(&target, false, |_| {}),
                        Err(WatchError::AlreadyWatching)
                    )
                }
            })
            .unwrap();
        assert!(rejected);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_end_to_end_create_write_and_delete() {
        let runner = TaskRunner::new("facade-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("tracked.txt");

        let (tx, rx) = mpsc::channel();
        let watcher = runner
            .post_and_wait({
                let runner = runner.clone();
                let target = target.clone();
                move || {
                    let mut watcher = PathWatcher::new(runner);
                    watcher
                        .watch(&target, false, move |event| {
                            let _ = tx.send(event);
                        })
                        .map(|()| watcher)
                }
            })
            .unwrap()
            .unwrap();

        // The target comes into existence only after the watch is armed;
        // create, append, and delete are each observed, in order.
        fs::write(&target, b"v1").unwrap();
        let event = rx.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.path, target);
        assert!(!event.error);
        while rx.recv_timeout(Duration::from_millis(500)).is_ok() {}

        fs::write(&target, b"v1 and then some").unwrap();
        let event = rx.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.path, target);
        assert!(!event.error);
        while rx.recv_timeout(Duration::from_millis(500)).is_ok() {}

        fs::remove_file(&target).unwrap();
        let event = rx.recv_timeout(EVENT_TIMEOUT).unwrap();
        assert_eq!(event.path, target);
        assert!(!event.error);

        drop(watcher);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_drop_cancels_delivery() {
        let runner = TaskRunner::new("facade-test").unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("dropped.txt");
        fs::write(&target, b"x").unwrap();

        let (tx, rx) = mpsc::channel();
        let watcher = runner
            .post_and_wait({
                let runner = runner.clone();
                let target = target.clone();
                move || {
                    let mut watcher = PathWatcher::new(runner);
                    watcher
                        .watch(&target, false, move |event| {
                            let _ = tx.send(event);
                        })
                        .map(|()| watcher)
                }
            })
            .unwrap()
            .unwrap();

        drop(watcher);
        runner.post_and_wait(|| ()).unwrap();

        fs::write(&target, b"y").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_recursive_capability_matches_platform() {
        let expected = cfg!(any(target_os = "linux", target_os = "macos", windows));
        assert_eq!(recursive_watch_available(), expected);
    }
}
