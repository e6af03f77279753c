//! Sequenced task execution on a dedicated thread.
//!
//! A [`TaskRunner`] is the "owning context" abstraction the watcher is built
//! on: a FIFO queue of closures drained by one named OS thread. Tasks posted
//! from any thread run in submission order, one at a time, with no two tasks
//! ever running concurrently. This gives the watcher single-threaded
//! semantics for its own state without any locking.
//!
//! # Lifecycle
//!
//! The runner thread starts in [`TaskRunner::new`] and exits when the last
//! clone of the handle is dropped (the task channel disconnects and the
//! drain loop ends). Tasks already queued at that point still run.
//!
//! # Examples
//!
//! ```
//! use pathwatch_core::TaskRunner;
//!
//! let runner = TaskRunner::new("docs").unwrap();
//! let doubled = runner.post_and_wait(|| 21 * 2);
//! assert_eq!(doubled, Some(42));
//! ```

use std::io;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

/// A closure queued for execution on the runner thread.
type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a sequenced, single-threaded task-execution context.
///
/// Cloning the handle is cheap; all clones refer to the same thread and
/// queue. The handle is [`Send`] and [`Sync`], so backend threads can post
/// work to the owning context from anywhere.
///
/// # Ordering
///
/// Tasks run in the order they were posted (FIFO), regardless of which
/// thread posted them. No ordering is guaranteed between tasks posted
/// concurrently from different threads, only that each runs exactly once
/// and none overlap.
#[derive(Clone)]
pub struct TaskRunner {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::Sender<Task>,
    thread_id: thread::ThreadId,
    name: String,
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("name", &self.inner.name)
            .field("thread_id", &self.inner.thread_id)
            .finish()
    }
}

impl TaskRunner {
    /// Spawns a new runner thread and returns a handle to it.
    ///
    /// The thread is named `pathwatch {name}` so it is identifiable in
    /// debuggers and thread dumps.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the OS refuses to spawn the thread.
    pub fn new(name: &str) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Task>();
        let (ready_tx, ready_rx) = mpsc::channel();

        thread::Builder::new()
            .name(format!("pathwatch {name}"))
            .spawn(move || {
                let _ = ready_tx.send(thread::current().id());
                while let Ok(task) = rx.recv() {
                    task();
                }
                tracing::trace!("task runner thread exiting");
            })?;

        let thread_id = ready_rx
            .recv()
            .map_err(|_| io::Error::other("task runner thread exited during startup"))?;

        Ok(Self {
            inner: Arc::new(Inner {
                tx,
                thread_id,
                name: name.to_owned(),
            }),
        })
    }

    /// Queues a closure for execution on the runner thread.
    ///
    /// Returns `false` if the runner thread has already exited, in which
    /// case the closure is dropped without running. Posting from the runner
    /// thread itself is allowed; the task runs after the current one
    /// finishes.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.inner.tx.send(Box::new(task)).is_ok()
    }

    /// Returns `true` if the calling thread is the runner thread.
    ///
    /// Used both as a precondition check (operations that must happen on
    /// the owning context) and as a fast path (run teardown inline instead
    /// of posting when already on the right thread).
    #[must_use]
    pub fn belongs_to_current_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Runs a closure on the runner thread and waits for its result.
    ///
    /// If called from the runner thread itself the closure runs inline,
    /// avoiding a self-deadlock. Returns `None` if the runner thread is
    /// gone or the task was dropped before producing a value.
    pub fn post_and_wait<T, F>(&self, task: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.belongs_to_current_thread() {
            return Some(task());
        }

        let (tx, rx) = mpsc::channel();
        let posted = self.post(move || {
            let _ = tx.send(task());
        });
        if !posted {
            return None;
        }
        rx.recv().ok()
    }
}
