//! Serial execution context for completion callbacks.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::logging::targets;

type Job = Box<dyn FnOnce() + Send>;

/// Runs posted callbacks one at a time, in posting order, on a task of the
/// given runtime.
///
/// Callbacks never run on the receive path, so a slow callback delays only
/// later callbacks, not message processing. A panicking callback is logged
/// and does not stop the queue.
#[derive(Clone, Debug)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Spawn the queue's worker task on `runtime`.
    pub fn new(runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        runtime.spawn(async move {
            while let Some(job) = rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!(target: targets::TRANSPORT, "Completion callback panicked");
                }
            }
        });
        Self { tx }
    }

    /// Queue a callback.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            tracing::debug!(target: targets::TRANSPORT, "Callback queue closed, dropping callback");
        }
    }
}
