//! Change notification payload.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single change notification delivered to a watch callback.
///
/// The `path` is always the logical watch target, not the specific file that
/// changed beneath it: a recursive watch on `/project` reports `/project`
/// even when `/project/src/main.rs` was the file written. Callers that need
/// the precise path re-probe the filesystem; the watcher's contract is
/// "something you care about changed", which is what the underlying OS
/// primitives can promise portably.
///
/// # Examples
///
/// ```
/// use pathwatch::ChangeEvent;
/// use std::path::PathBuf;
///
/// let event = ChangeEvent::new(PathBuf::from("/tmp/config.json"));
/// assert!(!event.error);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The logical watch target this notification is about.
    pub path: PathBuf,

    /// `true` only for the final notification of a watch whose backend hit
    /// an unrecoverable condition. No further events follow an error event.
    pub error: bool,
}

impl ChangeEvent {
    /// Creates a non-error change notification for `path`.
    #[inline]
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path, error: false }
    }

    /// Creates the terminal error notification for `path`.
    #[inline]
    #[must_use]
    pub const fn failed(path: PathBuf) -> Self {
        Self { path, error: true }
    }
}

/// The boxed callback a watch delivers [`ChangeEvent`]s to.
///
/// Invoked only on the owning task runner, zero or more times, until the
/// watch is cancelled (or once more with `error = true` if the backend
/// dies).
pub type ChangeCallback = Box<dyn FnMut(ChangeEvent) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        let ok = ChangeEvent::new(PathBuf::from("/a/b"));
        assert_eq!(ok.path, PathBuf::from("/a/b"));
        assert!(!ok.error);

        let failed = ChangeEvent::failed(PathBuf::from("/a/b"));
        assert!(failed.error);
    }

    #[test]
    fn test_event_serializes_to_json() {
        let event = ChangeEvent::new(PathBuf::from("/tmp/f"));
        let json = serde_json::to_string(&event).expect("serialize");
        assert!(json.contains("\"/tmp/f\""));
        assert!(json.contains("\"error\":false"));
    }
}
