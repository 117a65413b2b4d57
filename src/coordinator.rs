//! Single-threaded execution context for lifecycle callbacks.
//!
//! Every callback registered on a [`ServerSupervisor`](crate::ServerSupervisor)
//! runs on one coordination context, never on the task that pumps the server's
//! output. Hosts with their own UI or event loop implement [`Coordinator`];
//! everyone else uses [`CoordinatorThread`], a dedicated OS thread draining a
//! job queue in FIFO order.

use crate::error::{Error, Result};
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc;

/// A unit of work posted to the coordination context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes posted jobs one at a time, in posting order, on a single logical thread.
pub trait Coordinator: Send + Sync {
    /// Queue `job` for execution. Must not run it inline on the caller's stack.
    fn post(&self, job: Job);
}

/// Dedicated coordination thread.
///
/// The thread exits once the last handle is dropped and the queue is drained.
///
/// # Example
///
/// ```
/// use harness_supervisor::coordinator::{Coordinator, CoordinatorThread};
/// use std::sync::mpsc;
///
/// let coordinator = CoordinatorThread::spawn("example-coordinator").unwrap();
/// let (tx, rx) = mpsc::channel();
/// coordinator.post(Box::new(move || tx.send(42).unwrap()));
/// assert_eq!(rx.recv().unwrap(), 42);
/// ```
pub struct CoordinatorThread {
    sender: mpsc::UnboundedSender<Job>,
    thread_id: ThreadId,
}

impl CoordinatorThread {
    /// Start a named coordination thread.
    pub fn spawn(name: &str) -> Result<std::sync::Arc<Self>> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    // A panicking callback must not take the other subscribers down with it
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        tracing::error!("Callback panicked on the coordination thread");
                    }
                }
                tracing::debug!("Coordination thread exiting");
            })
            .map_err(|e| Error::Coordinator(format!("Failed to start coordination thread: {}", e)))?;

        Ok(std::sync::Arc::new(Self {
            sender,
            thread_id: handle.thread().id(),
        }))
    }

    /// Whether the caller is running on this coordination thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Coordinator for CoordinatorThread {
    fn post(&self, job: Job) {
        if self.sender.send(job).is_err() {
            tracing::warn!("Coordination thread is gone; dropping job");
        }
    }
}
