//! Cooperative suspension of a running job.
//!
//! A job that must wait for something outside the scheduler calls
//! [`BlockingCondition::block`]. The job gives up its owner key's mutex so
//! other queued jobs of the same owner can run, parks its worker thread until
//! the condition is released, then competes for the mutex again from the
//! head of the owner's queue.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::core::error::SchedulerError;
use crate::core::scheduler::Scheduler;
use crate::core::semaphore::Acquisition;
use crate::core::task::{current_task, OwnerKey, Parking, Task, TaskState};

struct ConditionState {
    blocking: Mutex<bool>,
    released: Condvar,
}

impl Parking for ConditionState {
    fn wake_all(&self) {
        let _blocking = self.blocking.lock();
        self.released.notify_all();
    }
}

/// A named gate that running jobs can wait on without holding their mutex.
///
/// Created by [`Scheduler::create_blocking_condition`]. Clones share the same
/// gate.
pub struct BlockingCondition<K: OwnerKey> {
    name: Arc<str>,
    state: Arc<ConditionState>,
    scheduler: Scheduler<K>,
}

impl<K: OwnerKey> Clone for BlockingCondition<K> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            state: Arc::clone(&self.state),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<K: OwnerKey> BlockingCondition<K> {
    pub(crate) fn new(name: String, blocking: bool, scheduler: Scheduler<K>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(ConditionState {
                blocking: Mutex::new(blocking),
                released: Condvar::new(),
            }),
            scheduler,
        }
    }

    /// Condition name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether [`BlockingCondition::block`] currently suspends its caller.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        *self.state.blocking.lock()
    }

    /// Arm or release the condition. Releasing wakes every waiting job.
    pub fn set_blocking(&self, blocking: bool) {
        let mut state = self.state.blocking.lock();
        *state = blocking;
        drop(state);
        if !blocking {
            self.state.released.notify_all();
        }
    }

    /// Release the condition; same as `set_blocking(false)`.
    ///
    /// Every waiting job competes for its mutex again. Jobs of the same
    /// owner resume one after the other, in no guaranteed order.
    pub fn unblock(&self) {
        self.set_blocking(false);
    }

    /// Suspend the calling job until the condition is released.
    ///
    /// Must be called from a running job that holds its owner key's mutex.
    /// Returns immediately if the condition is not armed. Otherwise the
    /// mutex is handed to the next queued job of the same owner for the
    /// duration of the wait, and reacquired at the head of the queue before
    /// this call returns.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::NotOwnerThread`] if the calling thread does not
    ///   run a job holding its mutex
    /// - [`SchedulerError::Interrupted`] if the job was cancelled with
    ///   interruption while waiting; the job no longer holds the mutex and
    ///   must return without touching owner state
    /// - [`SchedulerError::Rejected`] if the scheduler shut down before the
    ///   mutex could be reacquired
    pub fn block(&self) -> Result<(), SchedulerError> {
        let task = current_task::<K>()
            .and_then(|task| self.scheduler.owning_task(task.owner_key()))
            .ok_or_else(|| SchedulerError::NotOwnerThread(format!("condition `{}`", self.name)))?;

        if !self.is_blocking() {
            return Ok(());
        }

        debug!(condition = %self.name, job = %task.name(), "Job blocking; passing the mutex on");
        let semaphores = self.scheduler.semaphores();
        let parking: Arc<dyn Parking> = Arc::clone(&self.state) as Arc<dyn Parking>;
        task.park_on(Some(parking));
        semaphores.register_blocked(&task);
        self.scheduler.pass_mutex(&task);

        self.wait_released(&task);

        semaphores.unregister_blocked(&task);
        task.park_on(None);
        if task.is_interrupted() {
            debug!(condition = %self.name, job = %task.name(), "Job interrupted while blocked");
            return Err(self.interrupted(&task));
        }

        self.resume(&task)
    }

    fn wait_released(&self, task: &Task<K>) {
        let mut blocking = self.state.blocking.lock();
        while *blocking && !task.is_interrupted() {
            self.state.released.wait(&mut blocking);
        }
    }

    /// Win the mutex back ahead of every queued job.
    fn resume(&self, task: &Arc<Task<K>>) -> Result<(), SchedulerError> {
        task.advance(TaskState::Resuming);
        task.prepare_resume();
        match self.scheduler.semaphores().try_acquire_else_offer_head(task) {
            Acquisition::Acquired => {}
            Acquisition::Queued => {
                debug!(condition = %self.name, job = %task.name(), "Waiting to reacquire the mutex");
                if !task.await_resume() {
                    return Err(self.interrupted(task));
                }
            }
            Acquisition::Rejected => {
                return Err(SchedulerError::Rejected(format!(
                    "scheduler shut down while job `{}` was blocked",
                    task.name()
                )));
            }
        }
        task.advance(TaskState::Running);
        self.scheduler.publish_owner_thread(task.owner_key());
        debug!(condition = %self.name, job = %task.name(), "Job resumed");
        Ok(())
    }

    fn interrupted(&self, task: &Task<K>) -> SchedulerError {
        SchedulerError::Interrupted {
            condition: self.name.to_string(),
            job: task.name().to_owned(),
        }
    }
}

impl<K: OwnerKey> fmt::Debug for BlockingCondition<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingCondition")
            .field("name", &self.name)
            .field("blocking", &self.is_blocking())
            .finish_non_exhaustive()
    }
}
