//! Jobs, their lifecycle state, and the handles given back to submitters.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::core::context::CapturedContext;
use crate::core::error::SchedulerError;
use crate::core::scheduler::Scheduler;
use crate::core::semaphore::ChangeSignal;
use crate::util::clock::Deadline;

/// Unique job identifier within one scheduler.
pub type TaskId = u64;

/// Identity of a mutual-exclusion domain, e.g. a session.
///
/// Blanket-implemented for every type that is hashable, comparable,
/// cloneable and shareable across threads.
pub trait OwnerKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> OwnerKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Lifecycle state of a job.
///
/// `Pending -> Acquired -> Running -> Done` is the normal path. A running job
/// crossing a blocking condition passes through `Resuming` while it competes
/// for the mutex again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Submitted and waiting in its owner's queue.
    Pending,
    /// Owns the mutex and waits for a worker thread.
    Acquired,
    /// Executing on a worker thread.
    Running,
    /// Returned from a blocking condition and competing for the mutex.
    Resuming,
    /// Finished executing.
    Done,
    /// Cancelled before or while running.
    Cancelled,
    /// Refused at submission.
    Rejected,
}

impl TaskState {
    /// Whether the job can no longer run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Rejected)
    }
}

/// Where a job enters its owner's queue when the mutex is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePosition {
    /// Behind every queued job (FIFO).
    #[default]
    Tail,
    /// Ahead of every queued job.
    Head,
}

/// Describes a job to schedule.
#[derive(Debug, Clone)]
pub struct JobInput<K> {
    owner_key: K,
    name: Option<String>,
    position: QueuePosition,
    delay: Option<Duration>,
    expiration: Option<Duration>,
}

impl<K: OwnerKey> JobInput<K> {
    /// Input for a job serialized under `owner_key`.
    pub const fn new(owner_key: K) -> Self {
        Self {
            owner_key,
            name: None,
            position: QueuePosition::Tail,
            delay: None,
            expiration: None,
        }
    }

    /// Name used in logs and errors.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Queue position used if the mutex is taken.
    #[must_use]
    pub const fn with_position(mut self, position: QueuePosition) -> Self {
        self.position = position;
        self
    }

    /// Hold the job back for `delay` before it enters its owner's queue.
    /// A zero delay schedules at once.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel the job if it has not started within `expiration`, counted
    /// from the end of its delay.
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// The owner key.
    pub const fn owner_key(&self) -> &K {
        &self.owner_key
    }

    /// The queue position.
    pub const fn position(&self) -> QueuePosition {
        self.position
    }

    /// The delay before the job enters its owner's queue, if any.
    pub fn delay(&self) -> Option<Duration> {
        self.delay.filter(|delay| !delay.is_zero())
    }
}

pub(crate) type Work<K> = Box<dyn FnOnce(&JobContext<K>) + Send>;

/// Result sink of a job, erased over the result type.
pub(crate) trait Completion: Send + Sync {
    /// Complete with `error` unless already completed.
    fn fail(&self, error: SchedulerError) -> bool;
    fn is_done(&self) -> bool;
    fn is_cancelled(&self) -> bool;
}

enum Slot<R> {
    Pending,
    Ready(Result<R, SchedulerError>),
    Taken { cancelled: bool },
}

/// Result storage shared by a job and its [`JobFuture`], with Condvar-based
/// notification. The first completion wins.
pub(crate) struct ResultSlot<R> {
    slot: Mutex<Slot<R>>,
    ready: Condvar,
}

impl<R> ResultSlot<R> {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn complete(&self, outcome: Result<R, SchedulerError>) -> bool {
        let mut slot = self.slot.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = Slot::Ready(outcome);
        drop(slot);
        self.ready.notify_all();
        true
    }

    fn take(slot: &mut Slot<R>) -> Result<R, SchedulerError> {
        let cancelled = matches!(slot, Slot::Ready(Err(e)) if e.is_cancellation());
        match std::mem::replace(slot, Slot::Taken { cancelled }) {
            Slot::Ready(outcome) => outcome,
            Slot::Pending | Slot::Taken { .. } => Err(SchedulerError::ResultTaken),
        }
    }

    fn try_take(&self) -> Option<Result<R, SchedulerError>> {
        let mut slot = self.slot.lock();
        match *slot {
            Slot::Pending => None,
            _ => Some(Self::take(&mut slot)),
        }
    }

    fn wait(&self, deadline: Deadline) -> Result<R, SchedulerError> {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Pending) {
            match deadline.instant() {
                None => self.ready.wait(&mut slot),
                Some(at) => {
                    if self.ready.wait_until(&mut slot, at).timed_out() && matches!(*slot, Slot::Pending) {
                        return Err(SchedulerError::Timeout);
                    }
                }
            }
        }
        Self::take(&mut slot)
    }
}

impl<R: Send> Completion for ResultSlot<R> {
    fn fail(&self, error: SchedulerError) -> bool {
        self.complete(Err(error))
    }

    fn is_done(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Pending)
    }

    fn is_cancelled(&self) -> bool {
        match &*self.slot.lock() {
            Slot::Pending | Slot::Ready(Ok(_)) => false,
            Slot::Ready(Err(e)) => e.is_cancellation(),
            Slot::Taken { cancelled } => *cancelled,
        }
    }
}

/// Something a parked job waits on, woken when the job is interrupted.
pub(crate) trait Parking: Send + Sync {
    fn wake_all(&self);
}

#[derive(Default)]
struct ResumeGrant {
    granted: bool,
    abandoned: bool,
}

/// A unit of scheduled work with its lifecycle state.
pub(crate) struct Task<K: OwnerKey> {
    id: TaskId,
    owner_key: K,
    name: String,
    expires_at: Option<Instant>,
    position: QueuePosition,
    state: Mutex<TaskState>,
    work: Mutex<Option<Work<K>>>,
    context: Mutex<Option<CapturedContext>>,
    completion: Arc<dyn Completion>,
    changed: Arc<ChangeSignal>,
    cancel_requested: AtomicBool,
    interrupted: AtomicBool,
    holds_mutex: AtomicBool,
    parked_on: Mutex<Option<Arc<dyn Parking>>>,
    resume: Mutex<ResumeGrant>,
    resumed: Condvar,
}

impl<K: OwnerKey> Task<K> {
    pub(crate) fn new(
        id: TaskId,
        input: JobInput<K>,
        work: Work<K>,
        context: CapturedContext,
        completion: Arc<dyn Completion>,
        changed: Arc<ChangeSignal>,
    ) -> Self {
        let name = input.name.unwrap_or_else(|| format!("job-{id}"));
        let delay = input.delay.unwrap_or_default();
        let expires_at = input
            .expiration
            .and_then(|e| Instant::now().checked_add(delay)?.checked_add(e));
        Self {
            id,
            owner_key: input.owner_key,
            name,
            expires_at,
            position: input.position,
            state: Mutex::new(TaskState::Pending),
            work: Mutex::new(Some(work)),
            context: Mutex::new(Some(context)),
            completion,
            changed,
            cancel_requested: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            holds_mutex: AtomicBool::new(false),
            parked_on: Mutex::new(None),
            resume: Mutex::new(ResumeGrant::default()),
            resumed: Condvar::new(),
        }
    }

    pub(crate) const fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) const fn owner_key(&self) -> &K {
        &self.owner_key
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) const fn position(&self) -> QueuePosition {
        self.position
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Move to `next` unless the job already reached a terminal state.
    pub(crate) fn advance(&self, next: TaskState) -> bool {
        let advanced = {
            let mut state = self.state.lock();
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        };
        if advanced && next.is_terminal() {
            self.changed.notify();
        }
        advanced
    }

    pub(crate) fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    pub(crate) fn take_work(&self) -> Option<Work<K>> {
        self.work.lock().take()
    }

    pub(crate) fn take_context(&self) -> Option<CapturedContext> {
        self.context.lock().take()
    }

    pub(crate) fn completion(&self) -> &dyn Completion {
        self.completion.as_ref()
    }

    pub(crate) fn holds_mutex(&self) -> bool {
        self.holds_mutex.load(Ordering::Acquire)
    }

    pub(crate) fn set_holds_mutex(&self, holds: bool) {
        self.holds_mutex.store(holds, Ordering::Release);
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Refused at submission: the job never runs.
    pub(crate) fn reject(&self, reason: &str) {
        self.completion.fail(SchedulerError::Rejected(format!("{reason} [job={}]", self.name)));
        *self.state.lock() = TaskState::Rejected;
        self.changed.notify();
    }

    /// Cancel the job. A queued or acquired job will never run its work; a
    /// running job only sees the request through
    /// [`JobContext::is_cancelled`] unless `interrupt_if_running` wakes it
    /// out of a blocking condition.
    pub(crate) fn cancel(&self, interrupt_if_running: bool) -> bool {
        if !self.completion.fail(SchedulerError::Cancelled) {
            return false;
        }
        self.cancel_requested.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            if matches!(*state, TaskState::Pending | TaskState::Acquired) {
                *state = TaskState::Cancelled;
            }
        }
        if interrupt_if_running {
            self.interrupt();
        }
        self.changed.notify();
        true
    }

    /// Wake the job if it waits on a blocking condition or for the mutex.
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        let parked = self.parked_on.lock().clone();
        if let Some(parking) = parked {
            parking.wake_all();
        }
        let _grant = self.resume.lock();
        self.resumed.notify_all();
    }

    pub(crate) fn park_on(&self, parking: Option<Arc<dyn Parking>>) {
        *self.parked_on.lock() = parking;
    }

    /// Arm the resume hand-shake before offering the job to its semaphore.
    pub(crate) fn prepare_resume(&self) {
        *self.resume.lock() = ResumeGrant::default();
    }

    /// Hand the mutex to the resuming thread. Returns `false` if the thread
    /// gave up, in which case the caller must pass the mutex on.
    pub(crate) fn grant_resume(&self) -> bool {
        let mut grant = self.resume.lock();
        if grant.abandoned {
            return false;
        }
        grant.granted = true;
        drop(grant);
        self.resumed.notify_all();
        true
    }

    /// Whether the job stopped waiting for the mutex after an interrupt. Its
    /// queue entry is then released by whoever polls it, not by the job.
    pub(crate) fn resume_abandoned(&self) -> bool {
        self.resume.lock().abandoned
    }

    /// Wait until [`Task::grant_resume`] or an interrupt. Returns whether the
    /// mutex was granted.
    pub(crate) fn await_resume(&self) -> bool {
        let mut grant = self.resume.lock();
        loop {
            if grant.granted {
                return true;
            }
            if self.is_interrupted() {
                grant.abandoned = true;
                return false;
            }
            self.resumed.wait(&mut grant);
        }
    }
}

impl<K: OwnerKey> fmt::Debug for Task<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner_key", &self.owner_key)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<dyn Any + Send + Sync>>> = const { RefCell::new(None) };
}

/// Bind `task` as the job running on this thread, returning the previous one.
pub(crate) fn bind_current(task: Option<Arc<dyn Any + Send + Sync>>) -> Option<Arc<dyn Any + Send + Sync>> {
    CURRENT_TASK.with(|current| current.replace(task))
}

/// The job running on this thread, if it belongs to a scheduler keyed by `K`.
pub(crate) fn current_task<K: OwnerKey>() -> Option<Arc<Task<K>>> {
    CURRENT_TASK
        .with(|current| current.borrow().clone())
        .and_then(|task| task.downcast::<Task<K>>().ok())
}

/// Shared, read-mostly view of a scheduled job.
#[derive(Clone)]
pub struct JobHandle<K: OwnerKey> {
    task: Arc<Task<K>>,
}

impl<K: OwnerKey> JobHandle<K> {
    pub(crate) const fn new(task: Arc<Task<K>>) -> Self {
        Self { task }
    }

    pub(crate) const fn task(&self) -> &Arc<Task<K>> {
        &self.task
    }

    /// Job identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Owner key the job is serialized under.
    #[must_use]
    pub fn owner_key(&self) -> &K {
        self.task.owner_key()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Whether the job's result is available.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.task.completion().is_done()
    }

    /// Whether the job was cancelled or rejected.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.completion().is_cancelled()
    }

    /// Cancel the job; see [`JobFuture::cancel`].
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        self.task.cancel(interrupt_if_running)
    }
}

impl<K: OwnerKey> fmt::Debug for JobHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.task.fmt(f)
    }
}

impl<K: OwnerKey> PartialEq for JobHandle<K> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.task, &other.task)
    }
}

impl<K: OwnerKey> Eq for JobHandle<K> {}

impl<K: OwnerKey> Hash for JobHandle<K> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.task.id().hash(state);
    }
}

/// Result handle of a scheduled job.
pub struct JobFuture<K: OwnerKey, R> {
    handle: JobHandle<K>,
    slot: Arc<ResultSlot<R>>,
}

impl<K: OwnerKey, R: Send + 'static> JobFuture<K, R> {
    pub(crate) const fn new(handle: JobHandle<K>, slot: Arc<ResultSlot<R>>) -> Self {
        Self { handle, slot }
    }

    /// Handle to the job, e.g. for visitors and predicates.
    #[must_use]
    pub const fn handle(&self) -> &JobHandle<K> {
        &self.handle
    }

    /// Current lifecycle state of the job.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.handle.state()
    }

    /// Whether the result is available.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    /// Whether the job was cancelled or rejected.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.slot.is_cancelled()
    }

    /// Cancel the job. Returns `false` if it already completed.
    ///
    /// A job that is still queued never runs. A running job is cancelled
    /// cooperatively: it should poll [`JobContext::is_cancelled`]. With
    /// `interrupt_if_running`, a job parked on a blocking condition is woken
    /// and its `block()` call fails with [`SchedulerError::Interrupted`].
    pub fn cancel(&self, interrupt_if_running: bool) -> bool {
        self.handle.cancel(interrupt_if_running)
    }

    /// Block until the job completes and take its result.
    ///
    /// # Errors
    ///
    /// The job's failure, cancellation or rejection, or
    /// [`SchedulerError::ResultTaken`] if the result was already taken.
    pub fn wait(&self) -> Result<R, SchedulerError> {
        self.slot.wait(Deadline::never())
    }

    /// Like [`JobFuture::wait`], giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Timeout`] if no result arrived in time, otherwise as
    /// for [`JobFuture::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> Result<R, SchedulerError> {
        self.slot.wait(Deadline::after(timeout))
    }

    /// Take the result if it is available.
    pub fn try_take(&self) -> Option<Result<R, SchedulerError>> {
        self.slot.try_take()
    }

    /// Wait for the result from async code, on tokio's blocking pool.
    ///
    /// # Errors
    ///
    /// As for [`JobFuture::wait_timeout`].
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(&self, timeout: Duration) -> Result<R, SchedulerError> {
        let slot = Arc::clone(&self.slot);
        tokio::task::spawn_blocking(move || slot.wait(Deadline::after(timeout)))
            .await
            .map_err(|e| SchedulerError::Panicked(e.to_string()))?
    }
}

impl<K: OwnerKey, R> fmt::Debug for JobFuture<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobFuture").field("job", &self.handle).finish()
    }
}

/// Context handed to a running work body.
pub struct JobContext<K: OwnerKey> {
    scheduler: Scheduler<K>,
    task: Arc<Task<K>>,
}

impl<K: OwnerKey> JobContext<K> {
    pub(crate) const fn new(scheduler: Scheduler<K>, task: Arc<Task<K>>) -> Self {
        Self { scheduler, task }
    }

    /// The scheduler running this job, for nested scheduling.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler<K> {
        &self.scheduler
    }

    /// Owner key of this job.
    #[must_use]
    pub fn owner_key(&self) -> &K {
        self.task.owner_key()
    }

    /// Job identifier.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.task.name()
    }

    /// Handle to this job.
    #[must_use]
    pub fn handle(&self) -> JobHandle<K> {
        JobHandle::new(Arc::clone(&self.task))
    }

    /// Whether cancellation was requested. Long-running work should poll this
    /// and return early.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancel_requested()
    }
}
