//! Elastic pool of worker threads that physically execute scheduled jobs.
//!
//! The pool knows nothing about owner keys or mutexes: it runs whatever
//! closure it is handed. Mutual exclusion is enforced before a job ever
//! reaches the pool, by the scheduler and its semaphores.
//!
//! # Key Features
//!
//! - **Elastic**: a fixed set of core workers, plus surplus workers spawned
//!   while jobs wait and no worker is idle, so threads parked on a blocking
//!   condition cannot starve other owners' work
//! - **No polling**: workers block on the channel; surplus workers time out
//! - **Explicit rejection**: a full queue or a shut-down pool hands the
//!   rejection back to the submitter instead of dropping the job silently

#[cfg(not(target_arch = "wasm32"))]
mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A job the pool executes.
pub(crate) type PoolJob = Box<dyn FnOnce() + Send + 'static>;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug)]
pub enum PoolError {
    /// The job queue is full; no more jobs can be accepted.
    QueueFull,

    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// Internal error (thread spawn failure, channel closed, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "job queue is full"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live worker threads.
    pub worker_count: usize,

    /// Workers waiting for a job.
    pub idle_workers: usize,

    /// Jobs currently executing, including jobs parked on a blocking
    /// condition.
    pub active_jobs: u64,

    /// Jobs waiting for a worker.
    pub queued_jobs: u64,

    /// Jobs that finished executing.
    pub completed_jobs: u64,

    /// Jobs that panicked outside the scheduler's own unwinding guard.
    pub panicked_jobs: u64,

    /// Jobs accepted by the pool.
    pub submitted_jobs: u64,

    /// Jobs refused by the pool.
    pub rejected_jobs: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub live_workers: AtomicUsize,
    pub idle_workers: AtomicUsize,
    pub active_jobs: AtomicU64,
    pub queued_jobs: AtomicU64,
    pub completed_jobs: AtomicU64,
    pub panicked_jobs: AtomicU64,
    pub submitted_jobs: AtomicU64,
    pub rejected_jobs: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            worker_count: self.live_workers.load(Ordering::Relaxed),
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            active_jobs: self.active_jobs.load(Ordering::Relaxed),
            queued_jobs: self.queued_jobs.load(Ordering::Relaxed),
            completed_jobs: self.completed_jobs.load(Ordering::Relaxed),
            panicked_jobs: self.panicked_jobs.load(Ordering::Relaxed),
            submitted_jobs: self.submitted_jobs.load(Ordering::Relaxed),
            rejected_jobs: self.rejected_jobs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) use native::WorkerPool;
