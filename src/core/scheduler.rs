//! Per-owner mutual-exclusion scheduler.
//!
//! Jobs are submitted under an owner key and run on a shared pool of worker
//! threads, but never more than one job per owner key at a time. A job first
//! competes for its owner's mutex; the winner is dispatched to the worker
//! pool at once, losers wait in the owner's queue and are dispatched by the
//! release of the job before them.
//!
//! # Lifecycle
//!
//! ```text
//! Pending -> Acquired -> Running -> Done
//!    |          |           |
//!    |          +-----------+--> Cancelled
//!    +--> Rejected              Running -> Resuming -> Running (blocking condition)
//! ```
//!
//! The after-execute path always gives up the mutex, whether the work
//! succeeded, failed, panicked or never ran, so an owner key is never left
//! held by a job that is no longer running.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::blocking::BlockingCondition;
use crate::core::context::{AttachedContext, CapturedContext, ContextPropagator};
use crate::core::error::{AppResult, SchedulerError};
use crate::core::semaphore::{Acquisition, ChangeSignal};
use crate::core::semaphore_pool::MutexSemaphorePool;
use crate::core::task::{
    bind_current, current_task, Completion, JobContext, JobFuture, JobHandle, JobInput, OwnerKey,
    QueuePosition, ResultSlot, Task, TaskState, Work,
};
use crate::core::timer::{DelayTimer, Expiry};
use crate::core::worker_pool::{PoolError, PoolStats, WorkerPool};
use crate::util::clock::Deadline;

struct Inner<K: OwnerKey> {
    config: SchedulerConfig,
    semaphores: MutexSemaphorePool<K>,
    workers: WorkerPool,
    timer: DelayTimer,
    owner_threads: RwLock<HashMap<K, ThreadId>>,
    propagators: Vec<Arc<dyn ContextPropagator>>,
    next_id: AtomicU64,
}

/// Schedules jobs so that at most one job per owner key is active.
///
/// Cloning is cheap and yields a handle to the same scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use prometheus_model_mutex::config::SchedulerConfig;
/// use prometheus_model_mutex::core::Scheduler;
///
/// let scheduler = Scheduler::new(SchedulerConfig::default())?;
/// let future = scheduler.schedule("session-1", |ctx| {
///     Ok(format!("ran {}", ctx.name()))
/// });
/// assert_eq!(future.wait()?, "ran job-1");
/// scheduler.shutdown();
/// # Ok::<(), prometheus_model_mutex::core::SchedulerError>(())
/// ```
pub struct Scheduler<K: OwnerKey> {
    inner: Arc<Inner<K>>,
}

impl<K: OwnerKey> Clone for Scheduler<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: OwnerKey> Scheduler<K> {
    /// Create a scheduler and start its worker pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] for an invalid configuration,
    /// [`SchedulerError::WorkerPool`] if worker threads cannot be started.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        Self::with_propagators(config, Vec::new())
    }

    pub(crate) fn with_propagators(
        config: SchedulerConfig,
        propagators: Vec<Arc<dyn ContextPropagator>>,
    ) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::InvalidConfig)?;
        let workers = WorkerPool::new(config.clone())?;
        let timer = DelayTimer::new(format!("{}-timer", config.thread_name_prefix))?;
        let changed = Arc::new(ChangeSignal::new());

        info!(
            core_workers = config.core_worker_count,
            propagators = propagators.len(),
            "Scheduler started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                semaphores: MutexSemaphorePool::new(changed),
                workers,
                timer,
                owner_threads: RwLock::new(HashMap::new()),
                propagators,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// The configuration this scheduler was built with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Schedule `work` at the tail of `owner_key`'s queue.
    pub fn schedule<R, F>(&self, owner_key: K, work: F) -> JobFuture<K, R>
    where
        R: Send + 'static,
        F: FnOnce(&JobContext<K>) -> AppResult<R> + Send + 'static,
    {
        self.schedule_with(JobInput::new(owner_key), work)
    }

    /// Schedule `work` at `position` in `owner_key`'s queue.
    pub fn schedule_at<R, F>(&self, owner_key: K, position: QueuePosition, work: F) -> JobFuture<K, R>
    where
        R: Send + 'static,
        F: FnOnce(&JobContext<K>) -> AppResult<R> + Send + 'static,
    {
        self.schedule_with(JobInput::new(owner_key).with_position(position), work)
    }

    /// Schedule `work` at the tail of `owner_key`'s queue once `delay` has
    /// elapsed.
    pub fn schedule_delayed<R, F>(&self, owner_key: K, delay: Duration, work: F) -> JobFuture<K, R>
    where
        R: Send + 'static,
        F: FnOnce(&JobContext<K>) -> AppResult<R> + Send + 'static,
    {
        self.schedule_with(JobInput::new(owner_key).with_delay(delay), work)
    }

    /// Schedule `work` described by `input`.
    ///
    /// The job runs as soon as its owner key's mutex is free. Failures are
    /// reported through the returned future, never by this call: after
    /// [`Scheduler::shutdown`] the future is already completed with
    /// [`SchedulerError::Rejected`].
    ///
    /// A delayed job waits on the scheduler's timer thread, not on a worker,
    /// and only enters its owner's queue once the delay elapses. Until then
    /// it is not live: [`Scheduler::visit`] and [`Scheduler::is_empty`] do
    /// not see it, though its future can still cancel it. Shutdown cancels
    /// it.
    pub fn schedule_with<R, F>(&self, input: JobInput<K>, work: F) -> JobFuture<K, R>
    where
        R: Send + 'static,
        F: FnOnce(&JobContext<K>) -> AppResult<R> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let delay = input.delay();
        let slot = Arc::new(ResultSlot::<R>::new());
        let sink = Arc::clone(&slot);
        let work: Work<K> = Box::new(move |ctx: &JobContext<K>| {
            let outcome = match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(SchedulerError::Work(e)),
                Err(payload) => Err(SchedulerError::Panicked(panic_message(payload.as_ref()))),
            };
            sink.complete(outcome);
        });

        let context = CapturedContext::capture(&self.inner.propagators);
        let completion: Arc<dyn Completion> = Arc::clone(&slot) as Arc<dyn Completion>;
        let task = Arc::new(Task::new(
            id,
            input,
            work,
            context,
            completion,
            self.inner.semaphores.changed(),
        ));
        let future = JobFuture::new(JobHandle::new(Arc::clone(&task)), slot);

        match delay {
            None => self.offer(task),
            Some(delay) if self.is_shutdown() => {
                debug!(job = %task.name(), ?delay, "Delayed job rejected: scheduler is shut down");
                task.reject("scheduler is shut down");
            }
            Some(delay) => match Instant::now().checked_add(delay) {
                Some(due) => self.offer_when_due(task, due),
                None => task.reject(&format!("delay {delay:?} is out of range")),
            },
        }
        future
    }

    /// Offer `task` to its owner's semaphore and dispatch it if it won the
    /// mutex.
    fn offer(&self, task: Arc<Task<K>>) {
        let acquisition = match task.position() {
            QueuePosition::Tail => self.inner.semaphores.try_acquire_else_offer_tail(&task),
            QueuePosition::Head => self.inner.semaphores.try_acquire_else_offer_head(&task),
        };
        match acquisition {
            Acquisition::Acquired => self.hand_over(task),
            Acquisition::Queued => {
                debug!(owner = ?task.owner_key(), job = %task.name(), "Mutex taken; job queued");
            }
            Acquisition::Rejected => {
                debug!(owner = ?task.owner_key(), job = %task.name(), "Job rejected: scheduler is shut down");
            }
        }
    }

    fn offer_when_due(&self, task: Arc<Task<K>>, due: Instant) {
        debug!(owner = ?task.owner_key(), job = %task.name(), "Job delayed");
        let scheduler = self.clone();
        self.inner.timer.schedule(
            due,
            Box::new(move |expiry| match expiry {
                Expiry::Due if task.state() == TaskState::Pending => scheduler.offer(task),
                Expiry::Due => {
                    debug!(job = %task.name(), state = ?task.state(), "Delayed job finished before its delay elapsed");
                }
                Expiry::Discarded => {
                    debug!(job = %task.name(), "Delayed job cancelled by shutdown");
                    task.cancel(true);
                }
            }),
        );
    }

    /// Run `work` synchronously on the calling thread.
    ///
    /// Only legal from inside a job that currently holds `owner_key`'s mutex,
    /// e.g. for re-entrant calls from running work; the work sees the
    /// caller's job context.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotOwnerThread`] if the calling thread does not hold
    /// the mutex, [`SchedulerError::Work`] if `work` fails.
    pub fn run_now<R, F>(&self, owner_key: &K, work: F) -> Result<R, SchedulerError>
    where
        F: FnOnce(&JobContext<K>) -> AppResult<R>,
    {
        let task = self
            .owning_task(owner_key)
            .ok_or_else(|| SchedulerError::NotOwnerThread(format!("{owner_key:?}")))?;
        let context = JobContext::new(self.clone(), task);
        work(&context).map_err(SchedulerError::Work)
    }

    /// The job running on this thread, if it holds `owner_key`'s mutex.
    pub(crate) fn owning_task(&self, owner_key: &K) -> Option<Arc<Task<K>>> {
        current_task::<K>().filter(|task| {
            task.owner_key() == owner_key && task.holds_mutex() && self.is_owner_thread(owner_key)
        })
    }

    /// Whether the calling thread is the one executing on behalf of
    /// `owner_key` right now.
    ///
    /// Lock-light rather than lock-free: a shared read of the owner-thread
    /// map, contended only while a job starts or gives up its mutex.
    #[must_use]
    pub fn is_owner_thread(&self, owner_key: &K) -> bool {
        self.inner.owner_threads.read().get(owner_key) == Some(&thread::current().id())
    }

    /// Whether the job is parked on a blocking condition.
    #[must_use]
    pub fn is_blocked(&self, job: &JobHandle<K>) -> bool {
        self.inner.semaphores.is_blocked(job.task())
    }

    /// Call `visitor` on every live job (owning, queued or blocked) that
    /// matches `predicate`, until the visitor returns `false`.
    ///
    /// Works on a point-in-time snapshot; jobs scheduled during the visit may
    /// be missed. Returns `false` if the visitor stopped early.
    pub fn visit<P, V>(&self, predicate: P, mut visitor: V) -> bool
    where
        P: Fn(&JobHandle<K>) -> bool,
        V: FnMut(&JobHandle<K>) -> bool,
    {
        self.inner.semaphores.visit(
            |task| predicate(&JobHandle::new(Arc::clone(task))),
            |task| visitor(&JobHandle::new(Arc::clone(task))),
        )
    }

    /// True if no live job matches `predicate`.
    pub fn is_empty<P>(&self, predicate: P) -> bool
    where
        P: Fn(&JobHandle<K>) -> bool,
    {
        self.inner
            .semaphores
            .is_empty(|task| predicate(&JobHandle::new(Arc::clone(task))))
    }

    /// Block until no live job matches `predicate`. Returns `false` if
    /// `timeout` elapsed first.
    pub fn wait_until_empty<P>(&self, predicate: P, timeout: Duration) -> bool
    where
        P: Fn(&JobHandle<K>) -> bool,
    {
        self.inner.semaphores.wait_until_empty(
            |task| predicate(&JobHandle::new(Arc::clone(task))),
            Deadline::after(timeout),
        )
    }

    /// Cancel every live job matching `predicate`. Returns `true` only if
    /// every matching job was cancelled by this call.
    pub fn cancel<P>(&self, predicate: P, interrupt_if_running: bool) -> bool
    where
        P: Fn(&JobHandle<K>) -> bool,
    {
        let mut all_cancelled = true;
        self.inner.semaphores.visit(
            |task| predicate(&JobHandle::new(Arc::clone(task))),
            |task| {
                all_cancelled &= task.cancel(interrupt_if_running);
                true
            },
        );
        all_cancelled
    }

    /// Stop accepting jobs, cancel every live or delayed job and shut down
    /// the worker pool.
    ///
    /// Jobs parked on a blocking condition are interrupted. Jobs scheduled
    /// afterwards are rejected without touching any mutex.
    pub fn shutdown(&self) {
        if self.inner.semaphores.is_rejecting() {
            return;
        }
        info!("Shutting down scheduler");

        self.inner.timer.shutdown();
        for task in self.inner.semaphores.snapshot() {
            task.cancel(true);
        }
        for task in self.inner.semaphores.shutdown() {
            task.cancel(true);
        }
        self.inner.owner_threads.write().clear();
        self.inner.workers.shutdown();
    }

    /// Whether [`Scheduler::shutdown`] was called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.semaphores.is_rejecting()
    }

    /// Create a blocking condition, armed if `blocking` is true.
    #[must_use]
    pub fn create_blocking_condition(&self, name: impl Into<String>, blocking: bool) -> BlockingCondition<K> {
        BlockingCondition::new(name.into(), blocking, self.clone())
    }

    /// Worker pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.workers.stats()
    }

    /// Number of owner keys with an owning or queued job.
    #[must_use]
    pub fn active_owner_count(&self) -> usize {
        self.inner.semaphores.len()
    }

    /// Whether `owner_key` has an owning or queued job.
    #[must_use]
    pub fn has_active_owner(&self, owner_key: &K) -> bool {
        self.inner.semaphores.contains(owner_key)
    }

    pub(crate) fn semaphores(&self) -> &MutexSemaphorePool<K> {
        &self.inner.semaphores
    }

    pub(crate) fn publish_owner_thread(&self, owner_key: &K) {
        self.inner
            .owner_threads
            .write()
            .insert(owner_key.clone(), thread::current().id());
    }

    fn clear_owner_thread(&self, owner_key: &K) {
        let mut owners = self.inner.owner_threads.write();
        if owners.get(owner_key) == Some(&thread::current().id()) {
            owners.remove(owner_key);
        }
    }

    /// Give up the mutex held by `task` and hand it to the next queued job.
    pub(crate) fn pass_mutex(&self, task: &Arc<Task<K>>) {
        self.clear_owner_thread(task.owner_key());
        if let Some(next) = self.inner.semaphores.release_and_poll(task) {
            self.hand_over(next);
        }
    }

    /// Dispatch a new mutex owner, following the chain of owners that cannot
    /// take the mutex over.
    fn hand_over(&self, task: Arc<Task<K>>) {
        let mut next = Some(task);
        while let Some(task) = next.take() {
            next = self.dispatch(task);
        }
    }

    /// Returns the next owner if `task` gave the mutex straight back.
    fn dispatch(&self, task: Arc<Task<K>>) -> Option<Arc<Task<K>>> {
        if task.state() == TaskState::Resuming {
            if task.grant_resume() {
                return None;
            }
            debug!(job = %task.name(), "Resuming job was interrupted; passing the mutex on");
            return self.inner.semaphores.release_and_poll(&task);
        }

        if !task.advance(TaskState::Acquired) {
            debug!(job = %task.name(), state = ?task.state(), "Job finished while queued; skipped");
            return self.inner.semaphores.release_and_poll(&task);
        }

        let scheduler = self.clone();
        let job = Arc::clone(&task);
        match self.inner.workers.execute(Box::new(move || scheduler.run(&job))) {
            Ok(()) => None,
            Err(e) => self.rejected(&task, &e),
        }
    }

    /// The worker pool refused `task`: fail it and release its mutex.
    fn rejected(&self, task: &Arc<Task<K>>, cause: &PoolError) -> Option<Arc<Task<K>>> {
        if self.is_shutdown() {
            debug!(job = %task.name(), error = %cause, "Job rejected by worker pool after shutdown");
        } else {
            warn!(job = %task.name(), owner = ?task.owner_key(), error = %cause, "Job rejected by worker pool");
        }
        task.reject(&cause.to_string());
        self.inner.semaphores.release_and_poll(task)
    }

    /// Executes on a worker thread.
    fn run(&self, task: &Arc<Task<K>>) {
        let span = tracing::debug_span!(
            "job",
            job = %task.name(),
            task_id = task.id(),
            owner = ?task.owner_key()
        );
        let _entered = span.enter();

        let prepared = self.before_execute(task);
        let attached = prepared.map(|(work, attached)| {
            let context = JobContext::new(self.clone(), Arc::clone(task));
            work(&context);
            attached
        });
        self.after_execute(task, attached);
    }

    fn before_execute(&self, task: &Arc<Task<K>>) -> Option<(Work<K>, Option<AttachedContext>)> {
        match catch_unwind(AssertUnwindSafe(|| self.prepare(task))) {
            Ok(prepared) => prepared,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job = %task.name(), panic = %message, "Before-execute hook panicked; job skipped");
                task.completion().fail(SchedulerError::Panicked(message));
                None
            }
        }
    }

    fn prepare(&self, task: &Arc<Task<K>>) -> Option<(Work<K>, Option<AttachedContext>)> {
        if task.is_expired() {
            debug!(job = %task.name(), "Job expired before it started");
            task.cancel(false);
            return None;
        }
        if !task.advance(TaskState::Running) {
            return None;
        }
        self.publish_owner_thread(task.owner_key());
        let current: Arc<dyn Any + Send + Sync> = Arc::clone(task) as Arc<dyn Any + Send + Sync>;
        bind_current(Some(current));
        let attached = task.take_context().map(CapturedContext::attach);
        let work = task.take_work()?;
        Some((work, attached))
    }

    /// Always runs, and always gives up a mutex the job still holds.
    fn after_execute(&self, task: &Arc<Task<K>>, attached: Option<Option<AttachedContext>>) {
        let ran = attached.is_some();
        let cleanup = catch_unwind(AssertUnwindSafe(|| {
            if let Some(attached) = attached.flatten() {
                attached.detach();
            }
            bind_current(None);
            if !ran {
                task.completion().fail(SchedulerError::Cancelled);
            }
            let next = if task.is_cancel_requested() {
                TaskState::Cancelled
            } else {
                TaskState::Done
            };
            task.advance(next);
        }));
        if cleanup.is_err() {
            error!(job = %task.name(), "After-execute hook panicked");
        }

        if task.holds_mutex() && !task.resume_abandoned() {
            self.pass_mutex(task);
        } else {
            self.clear_owner_thread(task.owner_key());
        }
    }
}

impl<K: OwnerKey> fmt::Debug for Scheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("active_owners", &self.active_owner_count())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}
