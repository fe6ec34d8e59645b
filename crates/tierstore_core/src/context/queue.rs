//! Serial execution queue owned by one managed context.
//!
//! # Responsibility
//! - Run submitted jobs one at a time, in submission order, on a dedicated
//!   thread.
//! - Offer fire-and-forget and blocking submission.
//!
//! # Invariants
//! - Jobs submitted to one queue never run concurrently with each other.
//! - `perform_and_wait` from the queue's own thread runs inline.
//! - A panicking job is logged and does not stop the queue.
//! - Dropping the last handle lets already-queued jobs finish, then the
//!   thread exits.

use log::{debug, error};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, ThreadId};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Queue submission failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue thread could not be started.
    Spawn { label: String, message: String },
    /// The queue thread is gone.
    Closed { label: String },
    /// The job panicked before producing a result.
    Panicked { label: String },
}

impl Display for QueueError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spawn { label, message } => {
                write!(f, "failed to start queue `{label}`: {message}")
            }
            Self::Closed { label } => write!(f, "queue `{label}` is closed"),
            Self::Panicked { label } => write!(f, "job on queue `{label}` panicked"),
        }
    }
}

impl Error for QueueError {}

/// Single-threaded FIFO executor.
#[derive(Debug)]
pub struct ContextQueue {
    label: String,
    sender: Sender<Job>,
    thread_id: ThreadId,
}

impl ContextQueue {
    /// Starts a queue thread named `tierstore-<label>`.
    pub fn spawn(label: impl Into<String>) -> Result<Self, QueueError> {
        let label = label.into();
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_label = label.clone();

        let handle = thread::Builder::new()
            .name(format!("tierstore-{label}"))
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!(
                            "event=queue_job module=context status=error queue={} error_code=job_panicked",
                            thread_label
                        );
                    }
                }
                debug!("event=queue_stop module=context status=ok queue={}", thread_label);
            })
            .map_err(|err| QueueError::Spawn {
                label: label.clone(),
                message: err.to_string(),
            })?;

        // Detached: the thread ends once every sender is dropped.
        let thread_id = handle.thread().id();
        Ok(Self {
            label,
            sender,
            thread_id,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns whether the caller is running on this queue's thread.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Enqueues `job` without waiting for it.
    pub fn perform(&self, job: impl FnOnce() + Send + 'static) -> Result<(), QueueError> {
        self.sender
            .send(Box::new(job))
            .map_err(|_| QueueError::Closed {
                label: self.label.clone(),
            })
    }

    /// Runs `job` on this queue and blocks until it returns.
    pub fn perform_and_wait<T, F>(&self, job: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_current() {
            return Ok(job());
        }

        let (result_sender, result_receiver) = mpsc::channel();
        self.perform(move || {
            let _ = result_sender.send(job());
        })?;
        result_receiver.recv().map_err(|_| QueueError::Panicked {
            label: self.label.clone(),
        })
    }
}
