//! Integration tests for blocking conditions
//!
//! These tests validate:
//! - Other jobs of the same owner run while a job is blocked
//! - A released job resumes ahead of jobs queued while it was blocked
//! - Interruption while blocked and while waiting to resume
//! - Releasing a condition wakes every waiter

mod common;

use std::sync::{mpsc, Arc};

use parking_lot::Mutex;
use prometheus_model_mutex::core::{
    AppResult, JobContext, JobInput, Scheduler, SchedulerError, TaskState,
};

use common::{eventually, scheduler, TIMEOUT};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

type Order = Arc<Mutex<Vec<&'static str>>>;

fn named(name: &str) -> JobInput<&'static str> {
    JobInput::new("s1").with_name(name)
}

fn recorder(
    order: &Order,
    name: &'static str,
) -> impl FnOnce(&JobContext<&'static str>) -> AppResult<()> + Send + 'static {
    let order = Arc::clone(order);
    move |_| {
        order.lock().push(name);
        Ok(())
    }
}

/// Names of live jobs: owner first, then the queue, then blocked jobs.
fn live_names(scheduler: &Scheduler<&'static str>) -> Vec<String> {
    let mut names = Vec::new();
    scheduler.visit(|_| true, |job| {
        names.push(job.name().to_owned());
        true
    });
    names
}

// ============================================================================
// SUSPENSION AND RESUMPTION
// ============================================================================

#[test]
fn test_other_job_runs_while_blocked_and_blocked_job_resumes_first() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);
    let order: Order = Arc::new(Mutex::new(Vec::new()));

    let a = {
        let condition = condition.clone();
        let order = Arc::clone(&order);
        scheduler.schedule_with(named("A"), move |ctx| {
            order.lock().push("A-start");
            condition.block()?;
            order.lock().push("A-end");
            Ok(ctx.scheduler().is_owner_thread(&"s1"))
        })
    };
    assert!(eventually(|| scheduler.is_blocked(a.handle())));
    assert!(condition.is_blocking());

    let (b_started_tx, b_started_rx) = mpsc::channel::<()>();
    let (b_release_tx, b_release_rx) = mpsc::channel::<()>();
    let b = {
        let order = Arc::clone(&order);
        scheduler.schedule_with(named("B"), move |_| {
            order.lock().push("B");
            b_started_tx.send(())?;
            b_release_rx.recv_timeout(TIMEOUT)?;
            Ok(true)
        })
    };
    // B owns the mutex while A is suspended
    b_started_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(a.state(), TaskState::Running);

    let c = scheduler.schedule_with(named("C"), recorder(&order, "C"));
    assert_eq!(live_names(&scheduler), vec!["B", "C", "A"]);

    condition.unblock();
    assert!(eventually(|| live_names(&scheduler) == ["B", "A", "C"]));
    assert_eq!(a.state(), TaskState::Resuming);
    assert!(!scheduler.is_blocked(a.handle()));

    b_release_tx.send(()).unwrap();
    assert!(a.wait_timeout(TIMEOUT).unwrap());
    assert!(b.wait_timeout(TIMEOUT).unwrap());
    c.wait_timeout(TIMEOUT).unwrap();

    assert_eq!(*order.lock(), vec!["A-start", "B", "A-end", "C"]);
    assert!(eventually(|| !scheduler.has_active_owner(&"s1")));
    scheduler.shutdown();
}

#[test]
fn test_resumes_in_place_when_mutex_is_free() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);

    let a = {
        let condition = condition.clone();
        scheduler.schedule("s1", move |ctx| {
            let thread_before = std::thread::current().id();
            condition.block()?;
            Ok(thread_before == std::thread::current().id() && ctx.scheduler().is_owner_thread(&"s1"))
        })
    };
    assert!(eventually(|| scheduler.is_blocked(a.handle())));
    assert!(!scheduler.has_active_owner(&"s1"));
    assert!(!scheduler.is_empty(|job| *job.owner_key() == "s1"));

    condition.unblock();
    assert!(a.wait_timeout(TIMEOUT).unwrap());
    scheduler.shutdown();
}

#[test]
fn test_unblock_wakes_every_waiter() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);

    let waiters: Vec<_> = ["s1", "s1", "s2", "s3"]
        .into_iter()
        .map(|owner| {
            let condition = condition.clone();
            scheduler.schedule(owner, move |_| {
                condition.block()?;
                Ok(())
            })
        })
        .collect();
    assert!(eventually(|| waiters.iter().all(|w| scheduler.is_blocked(w.handle()))));

    condition.unblock();
    for waiter in &waiters {
        waiter.wait_timeout(TIMEOUT).unwrap();
    }
    assert!(scheduler.wait_until_empty(|_| true, TIMEOUT));
    scheduler.shutdown();
}

#[test]
fn test_job_can_block_twice() {
    let scheduler = scheduler::<&'static str>();
    let first = scheduler.create_blocking_condition("first", true);
    let second = scheduler.create_blocking_condition("second", true);
    let (between_tx, between_rx) = mpsc::channel::<()>();

    let job = {
        let (first, second) = (first.clone(), second.clone());
        scheduler.schedule("s1", move |_| {
            first.block()?;
            between_tx.send(())?;
            second.block()?;
            Ok("done")
        })
    };
    assert!(eventually(|| scheduler.is_blocked(job.handle())));
    first.unblock();
    between_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(eventually(|| scheduler.is_blocked(job.handle())));
    assert!(!scheduler.has_active_owner(&"s1"));
    second.unblock();
    assert_eq!(job.wait_timeout(TIMEOUT).unwrap(), "done");
    scheduler.shutdown();
}

// ============================================================================
// INTERRUPTION
// ============================================================================

#[test]
fn test_interrupt_while_blocked() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);
    let (outcome_tx, outcome_rx) = mpsc::channel();

    let a = {
        let condition = condition.clone();
        scheduler.schedule("s1", move |ctx| {
            let result = condition.block();
            outcome_tx.send((
                matches!(result, Err(SchedulerError::Interrupted { .. })),
                ctx.scheduler().is_owner_thread(&"s1"),
            ))?;
            result?;
            Ok(())
        })
    };
    assert!(eventually(|| scheduler.is_blocked(a.handle())));

    assert!(a.cancel(true));
    assert_eq!(outcome_rx.recv_timeout(TIMEOUT).unwrap(), (true, false));
    assert!(matches!(a.wait_timeout(TIMEOUT), Err(SchedulerError::Cancelled)));
    assert!(eventually(|| a.state() == TaskState::Cancelled));
    assert!(!scheduler.is_blocked(a.handle()));
    assert!(condition.is_blocking());

    // the owner key is free for the next job
    let next = scheduler.schedule("s1", |_| Ok(7));
    assert_eq!(next.wait_timeout(TIMEOUT).unwrap(), 7);
    scheduler.shutdown();
}

#[test]
fn test_cancel_without_interrupt_keeps_job_blocked() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);
    let a = {
        let condition = condition.clone();
        scheduler.schedule("s1", move |ctx| {
            condition.block()?;
            Ok(ctx.is_cancelled())
        })
    };
    assert!(eventually(|| scheduler.is_blocked(a.handle())));

    assert!(a.cancel(false));
    std::thread::sleep(std::time::Duration::from_millis(20));
    assert!(scheduler.is_blocked(a.handle()));

    condition.unblock();
    assert!(eventually(|| a.state() == TaskState::Cancelled));
    scheduler.shutdown();
}

#[test]
fn test_interrupt_while_waiting_to_resume_passes_mutex_on() {
    let scheduler = scheduler::<&'static str>();
    let condition = scheduler.create_blocking_condition("c1", true);
    let (outcome_tx, outcome_rx) = mpsc::channel();

    let a = {
        let condition = condition.clone();
        scheduler.schedule_with(named("A"), move |_| {
            let result = condition.block();
            outcome_tx.send(matches!(result, Err(SchedulerError::Interrupted { .. })))?;
            result?;
            Ok(())
        })
    };
    assert!(eventually(|| scheduler.is_blocked(a.handle())));

    let (h_started_tx, h_started_rx) = mpsc::channel::<()>();
    let (h_release_tx, h_release_rx) = mpsc::channel::<()>();
    let holder = scheduler.schedule_with(named("H"), move |_| {
        h_started_tx.send(())?;
        h_release_rx.recv_timeout(TIMEOUT)?;
        Ok(())
    });
    h_started_rx.recv_timeout(TIMEOUT).unwrap();
    let c = scheduler.schedule_with(named("C"), |_| Ok("C ran"));

    condition.unblock();
    assert!(eventually(|| live_names(&scheduler) == ["H", "A", "C"]));

    assert!(a.cancel(true));
    assert!(outcome_rx.recv_timeout(TIMEOUT).unwrap());

    h_release_tx.send(()).unwrap();
    holder.wait_timeout(TIMEOUT).unwrap();
    assert_eq!(c.wait_timeout(TIMEOUT).unwrap(), "C ran");
    assert!(eventually(|| !scheduler.has_active_owner(&"s1")));
    scheduler.shutdown();
}
