//! Error types for bounded fan-out

use thiserror::Error;

/// Errors that stop a [`WorkerPool`](super::WorkerPool) batch
///
/// Job results themselves are values; these only describe why the batch as a
/// whole did not finish.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    /// The batch's cancellation signal fired
    #[error("Dispatch cancelled")]
    Cancelled,

    /// The batch deadline passed with jobs still in flight
    #[error("Dispatch deadline exceeded")]
    DeadlineExceeded,

    /// A job panicked or was aborted
    #[error("Worker task failed: {0}")]
    TaskFailed(String),
}

impl PoolError {
    pub fn task_failed(msg: impl Into<String>) -> Self {
        Self::TaskFailed(msg.into())
    }
}
