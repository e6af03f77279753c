//! Cross-platform file and directory change watching.
//!
//! This crate lets a caller register interest in a filesystem path and
//! receive asynchronous notifications when that path - or, for recursive
//! watches, anything beneath it - is created, modified, deleted, or moved.
//! Each operating system exposes a different low-level primitive (inotify on
//! Linux, FSEvents and kqueue on macOS, directory change notifications on
//! Windows); the [`PathWatcher`] facade hides the differences behind one
//! callback contract.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Backend Thread (per OS)                     │
//! │  ┌──────────────────┐    ┌─────────────────┐                    │
//! │  │ inotify reader / │ -> │ event normalize │ -> post task       │
//! │  │ FSEvents / kqueue│    │ (wd, child,     │        │           │
//! │  │ / change handle  │    │  created, ...)  │        │           │
//! │  └──────────────────┘    └─────────────────┘        │           │
//! └─────────────────────────────────────────────────────│───────────┘
//!                                                       ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Owning TaskRunner (sequenced)                  │
//! │  ┌──────────────────┐    ┌─────────────────┐    ┌────────────┐  │
//! │  │ watch chain      │ -> │ classification  │ -> │ callback   │  │
//! │  │ maintenance      │    │ (target hit?)   │    │ (path,err) │  │
//! │  └──────────────────┘    └─────────────────┘    └────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A watch that targets a path whose ancestors do not all exist yet keeps a
//! *chain* of per-component OS watches: one for each existing directory on
//! the way down, re-anchored whenever a component appears, disappears, or is
//! replaced. Recursive watches additionally keep one OS watch per known
//! descendant directory.
//!
//! # Usage
//!
//! ```no_run
//! use pathwatch::PathWatcher;
//! use pathwatch_core::TaskRunner;
//! use std::path::Path;
//!
//! let runner = TaskRunner::new("watch").unwrap();
//! runner
//!     .post_and_wait({
//!         let runner = runner.clone();
//!         move || {
//!             let mut watcher = PathWatcher::new(runner);
//!             watcher.watch(Path::new("/tmp/config.json"), false, |event| {
//!                 println!("{} changed (error: {})", event.path.display(), event.error);
//!             })?;
//!             // Keep `watcher` alive for as long as notifications are wanted;
//!             // dropping it cancels the watch.
//!             Ok::<_, pathwatch::WatchError>(watcher)
//!         }
//!     })
//!     .unwrap()
//!     .unwrap();
//! ```
//!
//! For async consumers, [`WatchStream`] bridges the callback to a tokio
//! channel:
//!
//! ```no_run
//! use pathwatch::WatchStream;
//! use pathwatch_core::TaskRunner;
//!
//! # async fn example() -> Result<(), pathwatch::WatchError> {
//! let runner = TaskRunner::new("watch")?;
//! let mut stream = WatchStream::watch(&runner, "/tmp/project", true)?;
//! while let Some(event) = stream.recv().await {
//!     println!("changed: {}", event.path.display());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Threading contract
//!
//! Every watch is owned by the [`TaskRunner`](pathwatch_core::TaskRunner) it
//! was created on: `watch()` must be called there, and the callback only
//! ever runs there, in the order the backend observed the events.
//! Cancellation (explicit or via drop) is safe from any thread and
//! guarantees no callback runs after it returns control flow to the owner.

#![deny(clippy::all)]
#![warn(missing_docs)]

mod backend;
mod chain;

pub mod error;
pub mod event;
pub mod stream;
pub mod watcher;

pub use error::WatchError;
pub use event::ChangeEvent;
pub use stream::WatchStream;
pub use watcher::{PathWatcher, recursive_watch_available};
