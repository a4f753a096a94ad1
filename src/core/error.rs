//! Error types for scheduler operations.

use thiserror::Error;

use crate::core::worker_pool::PoolError;

/// Errors observed through a job's result handle or returned by scheduler
/// operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job was refused at submission, because the scheduler is shut down
    /// or the worker pool is saturated.
    #[error("job rejected: {0}")]
    Rejected(String),
    /// The job was cancelled before it produced a result.
    #[error("job cancelled")]
    Cancelled,
    /// The job was interrupted while parked on a blocking condition or while
    /// competing for the mutex afterwards. It no longer owns the mutex.
    #[error("interrupted while waiting on blocking condition `{condition}` [job={job}]")]
    Interrupted {
        /// Name of the blocking condition.
        condition: String,
        /// Name of the interrupted job.
        job: String,
    },
    /// The calling thread does not hold the mutex of the owner key.
    #[error("wrong thread: the calling thread is not the owner thread of `{0}`")]
    NotOwnerThread(String),
    /// The work body returned an error.
    #[error("job failed: {0:#}")]
    Work(anyhow::Error),
    /// The work body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// A timed wait elapsed before the result was available.
    #[error("operation timed out")]
    Timeout,
    /// The result was already taken from the handle.
    #[error("result already taken")]
    ResultTaken,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The worker pool could not be started.
    #[error("worker pool error: {0}")]
    WorkerPool(#[from] PoolError),
}

impl SchedulerError {
    /// Whether the error means the job never completed its work because it
    /// was cancelled or rejected.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Rejected(_))
    }
}

/// Result type of submitted work bodies, using anyhow for caller-defined
/// failures.
pub type AppResult<T> = Result<T, anyhow::Error>;
