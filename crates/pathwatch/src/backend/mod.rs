//! Platform notification backends.
//!
//! One module per OS primitive. Each backend owns the raw notification
//! mechanism and a private thread that normalizes wakeups into
//! `(handle, child, created, deleted, is_directory)` events, posted to the
//! watch's owning task runner. Selection happens once, in
//! [`PathWatcher::watch`](crate::PathWatcher::watch), and is immutable for
//! the life of the watch.

#[cfg(target_os = "macos")]
pub(crate) mod fsevents;
#[cfg(target_os = "linux")]
pub(crate) mod inotify;
#[cfg(target_os = "macos")]
pub(crate) mod kqueue;
#[cfg(windows)]
pub(crate) mod windows;
