//! Core scheduling abstractions: the per-owner mutex, jobs, the scheduler
//! and blocking conditions.

pub mod blocking;
pub mod context;
pub mod error;
pub mod scheduler;
pub(crate) mod semaphore;
pub(crate) mod semaphore_pool;
pub mod task;
pub(crate) mod timer;
pub mod worker_pool;

pub use blocking::BlockingCondition;
pub use context::{ContextPropagator, ContextSnapshot, LocalKeyPropagator};
pub use error::{AppResult, SchedulerError};
pub use scheduler::Scheduler;
pub use task::{JobContext, JobFuture, JobHandle, JobInput, OwnerKey, QueuePosition, TaskId, TaskState};
pub use worker_pool::{PoolError, PoolStats};
