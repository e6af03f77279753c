//! Async adapter over the callback API.
//!
//! [`WatchStream`] owns a [`PathWatcher`] whose callback forwards into an
//! unbounded tokio channel, turning the push-style delivery contract into
//! something an async consumer can `await`. Unbounded is the right shape
//! here: the producer side is a single sequenced runner, and a consumer
//! that falls behind by more events than memory allows has bigger
//! problems than backpressure.

use std::path::Path;

use pathwatch_core::TaskRunner;
use tokio::sync::mpsc;

use crate::error::WatchError;
use crate::event::ChangeEvent;
use crate::watcher::PathWatcher;

/// An async stream of [`ChangeEvent`]s for one watched path.
///
/// Created with [`WatchStream::watch`]; the underlying watch is cancelled
/// when the stream is dropped. The stream ends (`recv` returns `None`)
/// after cancellation, or after the terminal error event of a failed
/// backend has been delivered.
#[derive(Debug)]
pub struct WatchStream {
    watcher: PathWatcher,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl WatchStream {
    /// Establishes a watch on `path` owned by `runner` and returns the
    /// receiving half.
    ///
    /// May be called from any thread; the registration itself is run on
    /// the owning runner and waited for, so errors surface synchronously.
    pub fn watch(
        runner: &TaskRunner,
        path: impl AsRef<Path>,
        recursive: bool,
    ) -> Result<Self, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let path = path.as_ref().to_path_buf();
        let watcher = runner
            .post_and_wait({
                let runner = runner.clone();
                move || {
                    let mut watcher = PathWatcher::new(runner);
                    watcher.watch(&path, recursive, move |event| {
                        let _ = tx.send(event);
                    })?;
                    Ok::<_, WatchError>(watcher)
                }
            })
            .ok_or(WatchError::RunnerGone)??;
        Ok(Self { watcher, rx })
    }

    /// Waits for the next change event. `None` means the watch has ended.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Returns an already-delivered event without waiting, if any.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Cancels the underlying watch. The stream drains any events already
    /// delivered, then ends.
    pub fn cancel(&mut self) {
        self.watcher.cancel();
    }
}
