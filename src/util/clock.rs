//! Absolute deadlines for timed waits.

use std::time::{Duration, Instant};

/// A point in time computed once from a timeout, so that re-checks after
/// spurious wake-ups never extend the overall wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// Deadline `timeout` from now. Overflowing timeouts never expire.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
        }
    }

    /// A deadline that never passes.
    #[must_use]
    pub const fn never() -> Self {
        Self { at: None }
    }

    /// The absolute instant, if bounded.
    #[must_use]
    pub const fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Whether the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }
}
