//! Integration tests for shutdown and rejected submissions
//!
//! These tests validate:
//! - Jobs scheduled after shutdown are rejected without creating owner entries
//! - Queued, running, blocked and delayed jobs are cancelled by shutdown
//! - A job refused by a saturated worker pool never stalls its owner's queue

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use prometheus_model_mutex::config::SchedulerConfig;
use prometheus_model_mutex::core::{Scheduler, SchedulerError, TaskState};

use common::{eventually, scheduler, TIMEOUT};

// ============================================================================
// SHUTDOWN
// ============================================================================

#[test]
fn test_jobs_after_shutdown_are_rejected() {
    let scheduler = scheduler::<&'static str>();
    scheduler.shutdown();
    assert!(scheduler.is_shutdown());

    let late = scheduler.schedule("s1", |_| Ok("ran"));
    assert!(late.is_done());
    assert!(late.is_cancelled());
    assert_eq!(late.state(), TaskState::Rejected);
    assert!(matches!(late.wait_timeout(TIMEOUT), Err(SchedulerError::Rejected(_))));
    assert!(!scheduler.has_active_owner(&"s1"));
    assert_eq!(scheduler.active_owner_count(), 0);

    // shutting down twice is harmless
    scheduler.shutdown();
}

#[test]
fn test_shutdown_cancels_running_and_queued_jobs() {
    let scheduler = scheduler::<&'static str>();
    let (started_tx, started_rx) = mpsc::channel::<()>();

    let running = scheduler.schedule("s1", move |ctx| {
        started_tx.send(())?;
        let deadline = Instant::now() + TIMEOUT;
        while !ctx.is_cancelled() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    });
    started_rx.recv_timeout(TIMEOUT).unwrap();
    let queued: Vec<_> = (0..3).map(|i| scheduler.schedule("s1", move |_| Ok(i))).collect();

    scheduler.shutdown();

    assert!(matches!(running.wait_timeout(TIMEOUT), Err(SchedulerError::Cancelled)));
    for job in &queued {
        assert!(job.is_cancelled());
        assert_eq!(job.state(), TaskState::Cancelled);
    }
    assert!(eventually(|| running.state() == TaskState::Cancelled));
    assert_eq!(scheduler.active_owner_count(), 0);
}

#[test]
fn test_shutdown_interrupts_blocked_jobs() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);
    let (outcome_tx, outcome_rx) = mpsc::channel();

    let blocked = {
        let condition = condition.clone();
        scheduler.schedule("s1", move |_| {
            let result = condition.block();
            outcome_tx.send(matches!(result, Err(SchedulerError::Interrupted { .. })))?;
            result?;
            Ok(())
        })
    };
    assert!(eventually(|| scheduler.is_blocked(blocked.handle())));

    scheduler.shutdown();
    assert!(outcome_rx.recv_timeout(TIMEOUT).unwrap());
    assert!(blocked.is_cancelled());
    assert!(scheduler.is_empty(|_| true));
}

#[test]
fn test_shutdown_cancels_delayed_jobs() {
    let scheduler = scheduler::<&'static str>();
    let ran = Arc::new(AtomicBool::new(false));

    let delayed = {
        let ran = Arc::clone(&ran);
        scheduler.schedule_delayed("s1", Duration::from_secs(60), move |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
    };
    assert_eq!(delayed.state(), TaskState::Pending);

    let started = Instant::now();
    scheduler.shutdown();
    assert!(started.elapsed() < Duration::from_secs(60));

    assert!(delayed.is_cancelled());
    assert_eq!(delayed.state(), TaskState::Cancelled);
    assert!(matches!(delayed.wait_timeout(TIMEOUT), Err(SchedulerError::Cancelled)));
    assert!(!ran.load(Ordering::SeqCst));
    assert!(!scheduler.has_active_owner(&"s1"));

    // delayed submissions after shutdown are refused outright
    let late = scheduler.schedule_delayed("s1", Duration::from_millis(1), |_| Ok(()));
    assert_eq!(late.state(), TaskState::Rejected);
    assert!(matches!(late.wait_timeout(TIMEOUT), Err(SchedulerError::Rejected(_))));
}

// ============================================================================
// WORKER POOL REJECTION
// ============================================================================

#[test]
fn test_rejected_hand_off_does_not_stall_owner() {
    let scheduler = Scheduler::<&'static str>::new(
        SchedulerConfig::new()
            .with_core_worker_count(1)
            .with_max_worker_count(1)
            .with_max_queue_depth(1),
    )
    .unwrap();
    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    // occupies the only worker
    let first = scheduler.schedule("s1", move |_| {
        started_tx.send(())?;
        release_rx.recv_timeout(TIMEOUT)?;
        Ok("first")
    });
    started_rx.recv_timeout(TIMEOUT).unwrap();

    let queued_a = scheduler.schedule("s1", |_| Ok("a"));
    let queued_b = scheduler.schedule("s1", |_| Ok("b"));
    // fills the worker queue
    let other = scheduler.schedule("s2", |_| Ok("other"));
    // the worker queue is full: refused at once, owner entry released
    let refused = scheduler.schedule("s3", |_| Ok("refused"));
    assert!(matches!(refused.wait_timeout(TIMEOUT), Err(SchedulerError::Rejected(_))));
    assert_eq!(refused.state(), TaskState::Rejected);
    assert!(!scheduler.has_active_owner(&"s3"));

    // the hand-off from `first` finds the worker queue still full
    release_tx.send(()).unwrap();
    assert_eq!(first.wait_timeout(TIMEOUT).unwrap(), "first");
    assert!(matches!(queued_a.wait_timeout(TIMEOUT), Err(SchedulerError::Rejected(_))));
    assert!(matches!(queued_b.wait_timeout(TIMEOUT), Err(SchedulerError::Rejected(_))));
    assert_eq!(other.wait_timeout(TIMEOUT).unwrap(), "other");
    assert!(eventually(|| scheduler.active_owner_count() == 0));
    assert!(scheduler.stats().rejected_jobs >= 3);

    // the owner key accepts work again
    let again = scheduler.schedule("s1", |_| Ok("again"));
    assert_eq!(again.wait_timeout(TIMEOUT).unwrap(), "again");
    scheduler.shutdown();
}
