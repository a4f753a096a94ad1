//! # Prometheus Model Mutex
//!
//! A per-owner mutual-exclusion job scheduler.
//!
//! Work is submitted under an *owner key* (a session, a document, a tenant)
//! and executed on a shared pool of worker threads, with the guarantee that
//! at most one job per owner key is active at any instant. Jobs of the same
//! owner run in submission order; jobs of different owners run in parallel.
//!
//! ## Core Problem Solved
//!
//! Single-threaded models (UI state, session state) must only ever be touched
//! by one thread at a time, but dedicating a thread to every session does not
//! scale. This crate hands a virtual "model thread" from job to job instead:
//!
//! - **Per-owner mutex**: a fair, non-blocking single-permit semaphore with a
//!   FIFO queue for every active owner key
//! - **Always release**: the mutex is passed on after every job, whether it
//!   succeeded, failed, panicked or was cancelled
//! - **Blocking conditions**: a running job can give up its mutex while it
//!   waits for an external event, then resume ahead of queued work
//! - **Elastic workers**: the worker pool grows while jobs wait and shrinks
//!   when idle, so parked jobs never starve other owners
//!
//! ## Example
//!
//! ```rust,no_run
//! use prometheus_model_mutex::builders::SchedulerBuilder;
//!
//! let scheduler = SchedulerBuilder::<String>::new().build()?;
//! let condition = scheduler.create_blocking_condition("user-input", true);
//!
//! let waiting = {
//!     let condition = condition.clone();
//!     scheduler.schedule("session-1".to_string(), move |_ctx| {
//!         // the mutex of "session-1" is free while we wait
//!         condition.block()?;
//!         Ok("resumed")
//!     })
//! };
//!
//! let other = scheduler.schedule("session-1".to_string(), |_ctx| Ok("ran meanwhile"));
//! assert_eq!(other.wait()?, "ran meanwhile");
//!
//! condition.unblock();
//! assert_eq!(waiting.wait()?, "resumed");
//! scheduler.shutdown();
//! # Ok::<(), prometheus_model_mutex::core::SchedulerError>(())
//! ```
//!
//! For complete examples, see:
//! - `tests/scheduler_test.rs` - Ordering, exclusion and idle detection
//! - `tests/blocking_condition_test.rs` - Suspension and resumption

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct schedulers from configuration.
pub mod builders;
/// Configuration models for the scheduler and its worker pool.
pub mod config;
/// Core scheduling abstractions: mutexes, jobs, scheduler, blocking conditions.
pub mod core;
/// Shared utilities.
pub mod util;

pub use crate::builders::SchedulerBuilder;
pub use crate::config::SchedulerConfig;
pub use crate::core::{
    BlockingCondition, JobContext, JobFuture, JobHandle, JobInput, QueuePosition, Scheduler, SchedulerError,
    TaskState,
};
