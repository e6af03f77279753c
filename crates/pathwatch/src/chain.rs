//! The per-component watch chain.
//!
//! A watch target's ancestors may not all exist when the watch is
//! registered, and any of them can disappear or be replaced later. The
//! chain tracks one entry per path component, root to leaf, each carrying
//! the OS watch handle currently bound to that level (if any). Rebuilding
//! the chain replaces entries rather than mutating them, so an in-flight
//! backend event holding an old handle can never observe a half-updated
//! entry.
//!
//! Layout for a target `/home/user/notes.txt`:
//!
//! ```text
//! index  watched dir      subdir
//!   0    /                "home"
//!   1    /home            "user"
//!   2    /home/user       "notes.txt"
//!   3    /home/user/notes.txt   ""      (the target itself)
//! ```
//!
//! Only the final entry has an empty `subdir`; that invariant is what event
//! classification leans on to tell "a component on the way" from "the
//! target itself".

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use smallvec::SmallVec;

/// One path component's watch state.
///
/// `H` is the backend's opaque watch-handle type (an inotify watch
/// descriptor on Linux, a vnode ident on macOS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainEntry<H> {
    /// The next path component below this level; empty only for the final
    /// entry, which stands for the target itself.
    pub subdir: OsString,

    /// The OS watch handle bound to this level, or `None` when the level
    /// cannot currently be watched (it does not exist, or everything above
    /// it is already unwatchable).
    pub watch: Option<H>,

    /// Set only when this component is a symbolic link that could not be
    /// watched directly: the final component of the link's target, watched
    /// through the target's parent directory instead. Lets a rename of the
    /// link itself be told apart from a change to what it points at.
    pub link_target: Option<OsString>,
}

impl<H> ChainEntry<H> {
    pub(crate) fn new(subdir: OsString) -> Self {
        Self {
            subdir,
            watch: None,
            link_target: None,
        }
    }
}

/// The ordered root-to-leaf sequence of chain entries.
///
/// Inline capacity covers typical path depths without a heap allocation.
pub(crate) type WatchChain<H> = SmallVec<[ChainEntry<H>; 8]>;

/// Builds the initial (entirely unwatched) chain for `target`.
///
/// One entry per normal path component plus the trailing target entry.
/// Root and prefix components are folded into [`watch_root`]; `.` segments
/// are dropped by the component iterator.
pub(crate) fn build<H>(target: &Path) -> WatchChain<H> {
    let mut chain = WatchChain::new();
    for component in target.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::Normal(name) => chain.push(ChainEntry::new(name.to_owned())),
            Component::ParentDir => chain.push(ChainEntry::new(OsString::from(".."))),
        }
    }
    chain.push(ChainEntry::new(OsString::new()));
    chain
}

/// Returns the filesystem root the chain walk starts from.
///
/// `/` on Unix; drive or UNC prefix plus root on Windows.
pub(crate) fn watch_root(target: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in target.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => root.push(component.as_os_str()),
            _ => break,
        }
    }
    root
}

/// Checks the chain invariant: every entry except the last has a non-empty
/// `subdir`, and exactly the last has an empty one.
pub(crate) fn is_valid<H>(chain: &WatchChain<H>) -> bool {
    let Some((last, rest)) = chain.split_last() else {
        return false;
    };
    last.subdir.is_empty() && rest.iter().all(|entry| !entry.subdir.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestChain = WatchChain<u32>;

    #[test]
    fn test_build_splits_components() {
        let chain: TestChain = build(Path::new("/home/user/notes.txt"));
        let subdirs: Vec<_> = chain.iter().map(|e| e.subdir.clone()).collect();
        assert_eq!(subdirs, vec!["home", "user", "notes.txt", ""]);
        assert!(is_valid(&chain));
    }

    #[test]
    fn test_build_for_root_is_single_target_entry() {
        let chain: TestChain = build(Path::new("/"));
        assert_eq!(chain.len(), 1);
        assert!(chain[0].subdir.is_empty());
        assert!(is_valid(&chain));
    }

    #[test]
    fn test_new_entries_are_unwatched() {
        let chain: TestChain = build(Path::new("/a/b"));
        assert!(chain.iter().all(|e| e.watch.is_none()));
        assert!(chain.iter().all(|e| e.link_target.is_none()));
    }

    #[test]
    fn test_watch_root_unix() {
        assert_eq!(watch_root(Path::new("/a/b/c")), PathBuf::from("/"));
    }

    #[test]
    fn test_invariant_rejects_misplaced_empty_subdir() {
        let mut chain: TestChain = build(Path::new("/a/b"));
        assert!(is_valid(&chain));

        chain[0].subdir = OsString::new();
        assert!(!is_valid(&chain));

        let empty: TestChain = WatchChain::new();
        assert!(!is_valid(&empty));
    }

    #[test]
    fn test_invariant_rejects_trailing_nonempty_subdir() {
        let mut chain: TestChain = build(Path::new("/a"));
        let last = chain.len() - 1;
        chain[last].subdir = OsString::from("oops");
        assert!(!is_valid(&chain));
    }
}
