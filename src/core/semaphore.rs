//! Single-permit, fair-queue semaphore guarding one owner key.
//!
//! The semaphore never blocks the caller: a task either becomes the owner
//! immediately or is queued, and is handed the mutex later by the owner's
//! [`MutexSemaphore::release_and_poll`]. Waiting for emptiness is the only
//! blocking operation and is driven by the shared [`ChangeSignal`].

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::core::task::{OwnerKey, QueuePosition, Task};
use crate::util::clock::Deadline;

/// Broadcast notification raised after any change to mutex ownership, queue
/// contents, or task liveness.
///
/// Changers may signal while holding their own locks. Waiters record the
/// generation before evaluating their predicate, outside the signal's lock,
/// and only sleep while the generation is unchanged, so a change cannot slip
/// between a check and the wait that follows it.
#[derive(Debug, Default)]
pub(crate) struct ChangeSignal {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl ChangeSignal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter so it re-evaluates its predicate.
    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        drop(generation);
        self.changed.notify_all();
    }

    /// Block until `done` holds or `deadline` passes. Returns the final
    /// evaluation of `done`.
    pub(crate) fn wait_until<F>(&self, deadline: Deadline, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        loop {
            let seen = *self.generation.lock();
            if done() {
                return true;
            }
            let mut generation = self.generation.lock();
            while *generation == seen {
                match deadline.instant() {
                    None => self.changed.wait(&mut generation),
                    Some(at) => {
                        if self.changed.wait_until(&mut generation, at).timed_out() {
                            drop(generation);
                            return done();
                        }
                    }
                }
            }
        }
    }
}

/// Outcome of [`MutexSemaphore::try_acquire_else_offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquisition {
    /// The task is now the owner and may run.
    Acquired,
    /// The task waits in the queue.
    Queued,
    /// The pool refused the task; no semaphore was touched.
    Rejected,
}

struct SemaphoreState<K: OwnerKey> {
    permits: usize,
    owner: Option<Arc<Task<K>>>,
    pending: VecDeque<Arc<Task<K>>>,
}

/// Mutex permit counter for one owner key.
///
/// Invariant: `permits == owner.is_some() as usize + pending.len()`.
pub(crate) struct MutexSemaphore<K: OwnerKey> {
    owner_key: K,
    state: Mutex<SemaphoreState<K>>,
    changed: Arc<ChangeSignal>,
}

impl<K: OwnerKey> MutexSemaphore<K> {
    pub(crate) fn new(owner_key: K, changed: Arc<ChangeSignal>) -> Self {
        Self {
            owner_key,
            state: Mutex::new(SemaphoreState {
                permits: 0,
                owner: None,
                pending: VecDeque::new(),
            }),
            changed,
        }
    }

    /// Make `task` the owner if the mutex is free, otherwise queue it at
    /// `position`. Returns whether the task acquired the mutex.
    pub(crate) fn try_acquire_else_offer(&self, task: &Arc<Task<K>>, position: QueuePosition) -> bool {
        let acquired = {
            let mut state = self.state.lock();
            if state.permits == 0 {
                state.owner = Some(Arc::clone(task));
                state.permits = 1;
                task.set_holds_mutex(true);
                true
            } else {
                state.permits += 1;
                match position {
                    QueuePosition::Head => state.pending.push_front(Arc::clone(task)),
                    QueuePosition::Tail => state.pending.push_back(Arc::clone(task)),
                }
                false
            }
        };
        self.changed.notify();
        acquired
    }

    /// Give up the mutex held by the current owner and pass it to the head of
    /// the queue, which is returned.
    ///
    /// The caller must be the current owner; the pool checks this before
    /// delegating here.
    pub(crate) fn release_and_poll(&self) -> Option<Arc<Task<K>>> {
        let next = {
            let mut state = self.state.lock();
            if let Some(previous) = state.owner.take() {
                previous.set_holds_mutex(false);
            }
            let next = state.pending.pop_front();
            if let Some(task) = &next {
                task.set_holds_mutex(true);
            }
            state.owner.clone_from(&next);
            if state.permits == 0 {
                tracing::error!(
                    owner = ?self.owner_key,
                    "mutex permit underflow on release; clamping to zero"
                );
            } else {
                state.permits -= 1;
            }
            next
        };
        self.changed.notify();
        next
    }

    /// Whether `task` currently owns the mutex.
    pub(crate) fn is_owner(&self, task: &Arc<Task<K>>) -> bool {
        self.state
            .lock()
            .owner
            .as_ref()
            .is_some_and(|owner| Arc::ptr_eq(owner, task))
    }

    /// Neither owned nor anything queued.
    pub(crate) fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.owner.is_none() && state.pending.is_empty()
    }

    /// Number of permits handed out: the owner plus every queued task.
    #[cfg(test)]
    pub(crate) fn permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Owner followed by queued tasks, copied under the lock.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Task<K>>> {
        let state = self.state.lock();
        state.owner.iter().chain(state.pending.iter()).cloned().collect()
    }

    /// True if no live task of this semaphore matches `predicate`.
    pub(crate) fn is_empty<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Arc<Task<K>>) -> bool,
    {
        !self
            .snapshot()
            .iter()
            .any(|task| !task.state().is_terminal() && predicate(task))
    }

    /// Drop ownership and the queue, returning every task that was held.
    pub(crate) fn reset(&self) -> Vec<Arc<Task<K>>> {
        let drained = {
            let mut state = self.state.lock();
            state.permits = 0;
            let drained: Vec<_> = state.owner.take().into_iter().chain(state.pending.drain(..)).collect();
            for task in &drained {
                task.set_holds_mutex(false);
            }
            drained
        };
        self.changed.notify();
        drained
    }
}
