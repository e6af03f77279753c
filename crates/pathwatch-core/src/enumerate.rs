//! Recursive subdirectory enumeration.
//!
//! The recursive watch mode needs to discover every directory beneath a
//! watched root so each can carry its own OS-level watch. This module wraps
//! the `ignore` crate's walker with the settings that matter for a watcher:
//!
//! - **No filtering.** Unlike a source-code scanner, a watcher must see
//!   hidden directories and directories listed in `.gitignore`; the standard
//!   filters are switched off.
//! - **Symlinks are never followed.** A symlink to a directory is reported
//!   as the link itself and its target is not descended into, so cyclic or
//!   self-referential link structures terminate.
//!
//! The returned iterator is lazy and finite; enumeration errors (races with
//! concurrent deletion, permission problems) skip the affected entry rather
//! than aborting the walk.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

/// Returns a lazy iterator over every directory strictly beneath `root`.
///
/// The root itself is not yielded. Entries that are symbolic links are
/// excluded even when their target is a directory: the caller installs
/// per-directory watches, and watching through a link would both double up
/// notifications and reopen the cycle problem.
///
/// If `root` does not exist or is not a directory the iterator is empty.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
///
/// for dir in pathwatch_core::subdirectories(Path::new("/tmp/project")) {
///     println!("would watch {}", dir.display());
/// }
/// ```
pub fn subdirectories(root: &Path) -> impl Iterator<Item = PathBuf> {
    WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(error) => {
                tracing::trace!(%error, "skipping unreadable entry during enumeration");
                None
            }
        })
        .filter(|entry| {
            entry.depth() > 0 && entry.file_type().is_some_and(|file_type| file_type.is_dir())
        })
        .map(ignore::DirEntry::into_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_nested_directories_are_reported() {
        let temp = TempDir::new().expect("temp dir");
        fs::create_dir_all(temp.path().join("a/b/c")).expect("mkdir");
        fs::create_dir_all(temp.path().join("d")).expect("mkdir");
        fs::write(temp.path().join("a/file.txt"), b"x").expect("write");

        let mut dirs: Vec<_> = subdirectories(temp.path()).collect();
        dirs.sort();

        assert_eq!(
            dirs,
            vec![
                temp.path().join("a"),
                temp.path().join("a/b"),
                temp.path().join("a/b/c"),
                temp.path().join("d"),
            ]
        );
    }

    #[test]
    fn test_hidden_and_ignored_directories_are_included() {
        let temp = TempDir::new().expect("temp dir");
        fs::create_dir_all(temp.path().join(".hidden")).expect("mkdir");
        fs::create_dir_all(temp.path().join("ignored")).expect("mkdir");
        fs::write(temp.path().join(".gitignore"), b"ignored/\n").expect("write");

        let mut dirs: Vec<_> = subdirectories(temp.path()).collect();
        dirs.sort();

        assert_eq!(
            dirs,
            vec![temp.path().join(".hidden"), temp.path().join("ignored")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_not_followed() {
        let temp = TempDir::new().expect("temp dir");
        fs::create_dir_all(temp.path().join("real/inner")).expect("mkdir");
        std::os::unix::fs::symlink(temp.path().join("real"), temp.path().join("link"))
            .expect("symlink");

        let mut dirs: Vec<_> = subdirectories(temp.path()).collect();
        dirs.sort();

        // The link is reported as itself (a symlink, not a directory), so it
        // is excluded; nothing beneath it is descended into twice.
        assert_eq!(
            dirs,
            vec![temp.path().join("real"), temp.path().join("real/inner")]
        );
    }

    #[test]
    fn test_missing_root_yields_nothing() {
        let temp = TempDir::new().expect("temp dir");
        let gone = temp.path().join("does-not-exist");
        assert_eq!(subdirectories(&gone).count(), 0);
    }

    #[test]
    fn test_root_itself_is_not_reported() {
        let temp = TempDir::new().expect("temp dir");
        assert_eq!(subdirectories(temp.path()).count(), 0);
    }
}
