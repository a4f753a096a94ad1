//! Tests for error types

use prometheus_model_mutex::core::{PoolError, SchedulerError};

#[test]
fn test_rejected_error() {
    let err = SchedulerError::Rejected("pool has been shut down".to_string());
    assert_eq!(format!("{}", err), "job rejected: pool has been shut down");
    assert!(err.is_cancellation());
}

#[test]
fn test_cancelled_error() {
    let err = SchedulerError::Cancelled;
    assert_eq!(format!("{}", err), "job cancelled");
    assert!(err.is_cancellation());
}

#[test]
fn test_interrupted_error() {
    let err = SchedulerError::Interrupted {
        condition: "c1".to_string(),
        job: "job-3".to_string(),
    };
    assert_eq!(
        format!("{}", err),
        "interrupted while waiting on blocking condition `c1` [job=job-3]"
    );
    assert!(!err.is_cancellation());
}

#[test]
fn test_work_error_keeps_context_chain() {
    let source = anyhow::anyhow!("disk full").context("saving session");
    let err = SchedulerError::Work(source);
    assert_eq!(format!("{}", err), "job failed: saving session: disk full");
}

#[test]
fn test_worker_pool_error_conversion() {
    let err: SchedulerError = PoolError::QueueFull.into();
    assert_eq!(format!("{}", err), "worker pool error: job queue is full");
}

#[test]
fn test_timeout_error() {
    assert_eq!(format!("{}", SchedulerError::Timeout), "operation timed out");
}
