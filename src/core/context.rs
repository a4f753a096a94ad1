//! Context propagation from the submitting thread to the worker thread.
//!
//! Each registered [`ContextPropagator`] snapshots some thread-bound state
//! (locale, principal, request data) when a job is scheduled. Before the job
//! executes, the snapshots are attached to the worker thread in registration
//! order; afterwards the displaced values are re-attached in reverse order.
//! Failures inside a propagator are logged and never abort the job's release
//! protocol.

use std::any::type_name;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::LocalKey;

/// Captures thread-bound state at schedule time.
pub trait ContextPropagator: Send + Sync + 'static {
    /// Name used when logging failures.
    fn name(&self) -> &str {
        type_name::<Self>()
    }

    /// Snapshot the calling thread's state.
    fn capture(&self) -> Box<dyn ContextSnapshot>;
}

/// State captured by a [`ContextPropagator`].
pub trait ContextSnapshot: Send + 'static {
    /// Install this state on the current thread and return the state it
    /// replaced.
    fn attach(self: Box<Self>) -> Box<dyn ContextSnapshot>;
}

/// Propagates the value of a `thread_local!` `RefCell`.
///
/// ```
/// use std::cell::RefCell;
/// use prometheus_model_mutex::core::LocalKeyPropagator;
///
/// thread_local! {
///     static LOCALE: RefCell<String> = RefCell::new(String::from("en"));
/// }
///
/// let propagator = LocalKeyPropagator::new(&LOCALE);
/// # let _ = propagator;
/// ```
pub struct LocalKeyPropagator<T: 'static> {
    key: &'static LocalKey<RefCell<T>>,
}

impl<T: Clone + Send + 'static> LocalKeyPropagator<T> {
    /// Propagator for `key`.
    pub const fn new(key: &'static LocalKey<RefCell<T>>) -> Self {
        Self { key }
    }
}

struct LocalKeySnapshot<T: 'static> {
    key: &'static LocalKey<RefCell<T>>,
    value: T,
}

impl<T: Clone + Send + 'static> ContextSnapshot for LocalKeySnapshot<T> {
    fn attach(self: Box<Self>) -> Box<dyn ContextSnapshot> {
        let key = self.key;
        let displaced = key.with(|cell| cell.replace(self.value));
        Box::new(LocalKeySnapshot { key, value: displaced })
    }
}

impl<T: Clone + Send + 'static> ContextPropagator for LocalKeyPropagator<T> {
    fn capture(&self) -> Box<dyn ContextSnapshot> {
        let value = self.key.with(|cell| cell.borrow().clone());
        Box::new(LocalKeySnapshot { key: self.key, value })
    }
}

struct Captured {
    propagator: String,
    snapshot: Box<dyn ContextSnapshot>,
}

/// Snapshots taken at schedule time, in propagator order.
pub(crate) struct CapturedContext {
    snapshots: Vec<Captured>,
}

impl CapturedContext {
    #[cfg(test)]
    pub(crate) const fn empty() -> Self {
        Self { snapshots: Vec::new() }
    }

    pub(crate) fn capture(propagators: &[Arc<dyn ContextPropagator>]) -> Self {
        let snapshots = propagators
            .iter()
            .filter_map(|propagator| {
                match catch_unwind(AssertUnwindSafe(|| propagator.capture())) {
                    Ok(snapshot) => Some(Captured {
                        propagator: propagator.name().to_owned(),
                        snapshot,
                    }),
                    Err(_) => {
                        tracing::error!(propagator = propagator.name(), "context capture panicked; skipped");
                        None
                    }
                }
            })
            .collect();
        Self { snapshots }
    }

    /// Attach every snapshot to the current thread.
    pub(crate) fn attach(self) -> AttachedContext {
        let displaced = self
            .snapshots
            .into_iter()
            .filter_map(|Captured { propagator, snapshot }| {
                match catch_unwind(AssertUnwindSafe(|| snapshot.attach())) {
                    Ok(previous) => Some(Captured {
                        propagator,
                        snapshot: previous,
                    }),
                    Err(_) => {
                        tracing::error!(propagator = %propagator, "context attach panicked");
                        None
                    }
                }
            })
            .collect();
        AttachedContext { displaced }
    }
}

/// Values displaced by [`CapturedContext::attach`].
pub(crate) struct AttachedContext {
    displaced: Vec<Captured>,
}

impl AttachedContext {
    /// Restore the displaced values, last attached first.
    pub(crate) fn detach(self) {
        for Captured { propagator, snapshot } in self.displaced.into_iter().rev() {
            if catch_unwind(AssertUnwindSafe(|| drop(snapshot.attach()))).is_err() {
                tracing::error!(propagator = %propagator, "context detach panicked");
            }
        }
    }
}
