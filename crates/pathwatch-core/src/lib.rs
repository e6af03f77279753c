//! Concurrency substrate and filesystem collaborators for `pathwatch`.
//!
//! This crate provides the two building blocks the watcher consumes but does
//! not own:
//!
//! - [`TaskRunner`] - a sequenced execution context backed by a single
//!   dedicated thread. Every logical watch is owned by exactly one runner:
//!   all of its state mutation and callback delivery happens there, and
//!   backend threads hand events over by posting tasks rather than sharing
//!   state.
//! - [`subdirectories`] - a lazy recursive directory enumerator used to
//!   discover the subtree beneath a recursively watched directory. Symbolic
//!   links are reported as themselves and never followed, so cyclic link
//!   structures cannot cause unbounded exploration.
//!
//! # Crate Dependencies
//!
//! ```text
//! pathwatch-cli ──► pathwatch ──► pathwatch-core
//! ```
//!
//! # Usage
//!
//! ```
//! use pathwatch_core::TaskRunner;
//!
//! let runner = TaskRunner::new("example").unwrap();
//! let posted = runner.post(|| {
//!     // Runs on the runner's dedicated thread.
//! });
//! assert!(posted);
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod enumerate;
pub mod runner;

pub use enumerate::subdirectories;
pub use runner::TaskRunner;
