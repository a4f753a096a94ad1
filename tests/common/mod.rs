//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::time::{Duration, Instant};

use prometheus_model_mutex::config::SchedulerConfig;
use prometheus_model_mutex::core::Scheduler;

/// Generous bound for anything that should happen "soon".
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn scheduler<K: prometheus_model_mutex::core::OwnerKey>() -> Scheduler<K> {
    prometheus_model_mutex::util::init_tracing();
    Scheduler::new(
        SchedulerConfig::new()
            .with_core_worker_count(4)
            .with_thread_name_prefix("test-worker"),
    )
    .unwrap()
}

/// Poll `condition` until it holds or `TIMEOUT` passes.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
