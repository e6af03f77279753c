//! Error types for the pathwatch crate.
//!
//! All failures of [`PathWatcher::watch`](crate::PathWatcher::watch) are
//! synchronous and surface here; once a watch is established, the only
//! failure channel is a [`ChangeEvent`](crate::ChangeEvent) delivered with
//! its `error` flag set (after which the watch is dead).

/// Errors that can occur while establishing a watch.
///
/// # Error Recovery Strategy
///
/// Every variant is terminal for the `PathWatcher` instance it came from:
/// `watch()` is single-shot by contract, so the caller recovers by creating
/// a fresh watcher. Nothing here is delivered through the change callback.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The underlying OS notification primitive could not be set up.
    ///
    /// Covers inotify instance creation, backend thread spawning, and
    /// resolution of a relative target against the current directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// `watch()` was called more than once on the same instance.
    ///
    /// A `PathWatcher` binds its target and recursion mode for life; create
    /// a new instance to watch something else.
    #[error("watch() may only be called once per PathWatcher")]
    AlreadyWatching,

    /// `watch()` was called from a thread other than the owning runner.
    ///
    /// All watch setup, state mutation, and callback delivery happen on the
    /// task runner the watcher was created with.
    #[error("watch() must be called on the owning task runner")]
    NotOnOwningRunner,

    /// A recursive watch was requested on a platform that cannot serve one.
    ///
    /// Query [`recursive_watch_available`](crate::recursive_watch_available)
    /// first to avoid this.
    #[error("recursive watching is not supported on this platform")]
    RecursiveUnsupported,

    /// The owning task runner has shut down and no longer accepts tasks.
    #[error("the owning task runner is no longer running")]
    RunnerGone,
}

impl WatchError {
    /// Returns `true` if the error is a usage error (wrong thread, second
    /// `watch()` call) rather than an environmental failure.
    #[inline]
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(self, Self::AlreadyWatching | Self::NotOnOwningRunner)
    }

    /// Returns `true` if the requested configuration can never succeed on
    /// this platform, as opposed to failing transiently.
    #[inline]
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::RecursiveUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_usage_errors_are_classified() {
        assert!(WatchError::AlreadyWatching.is_usage_error());
        assert!(WatchError::NotOnOwningRunner.is_usage_error());
        assert!(!WatchError::RecursiveUnsupported.is_usage_error());
        assert!(!WatchError::RunnerGone.is_usage_error());
    }

    #[test]
    fn test_unsupported_is_classified() {
        assert!(WatchError::RecursiveUnsupported.is_unsupported());
        assert!(!WatchError::AlreadyWatching.is_unsupported());
    }

    #[test]
    fn test_io_error_display() {
        let err = WatchError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(err.to_string().contains("I/O error"));
        assert!(!err.is_usage_error());
    }
}
