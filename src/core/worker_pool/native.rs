//! Native implementation of `WorkerPool` using OS threads.
//!
//! # Design Principles
//!
//! - **No polling**: Workers block on the channel; surplus workers use a
//!   receive timeout as their keep-alive
//! - **Lock-free fast path**: Atomic counters; the sender mutex is held only
//!   for the non-blocking `try_send`
//! - **Clean shutdown**: Dropping the sender lets workers drain the queue and
//!   exit naturally

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;

use super::{PoolCounters, PoolError, PoolJob, PoolStats};

/// Worker pool with dedicated OS threads.
///
/// # Design
///
/// - `core_worker_count` workers live until shutdown
/// - A surplus worker is spawned whenever a submitted job finds more jobs
///   queued than idle workers, up to `max_worker_count`
/// - Surplus workers exit after the configured keep-alive without work
pub struct WorkerPool {
    /// Pool configuration.
    config: SchedulerConfig,

    /// Job sender (to workers). Option allows clean shutdown by dropping.
    job_tx: Mutex<Option<Sender<PoolJob>>>,

    /// Receiver kept for spawning surplus workers and measuring backlog.
    job_rx: Receiver<PoolJob>,

    /// Pool statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Shutdown flag (lock-free atomic).
    shutdown: AtomicBool,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Worker ID counter, used for thread names.
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    /// Create a new worker pool and spawn its core workers.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid and
    /// `PoolError::Internal` if a core worker thread cannot be spawned.
    pub fn new(config: SchedulerConfig) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (job_tx, job_rx) = bounded::<PoolJob>(config.max_queue_depth);
        let pool = Self {
            job_tx: Mutex::new(Some(job_tx)),
            job_rx,
            counters: Arc::new(PoolCounters::default()),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::with_capacity(config.core_worker_count)),
            next_worker_id: AtomicUsize::new(0),
            config,
        };

        for _ in 0..pool.config.core_worker_count {
            pool.counters.live_workers.fetch_add(1, Ordering::AcqRel);
            if let Err(e) = pool.spawn_worker(None) {
                pool.counters.live_workers.fetch_sub(1, Ordering::AcqRel);
                pool.shutdown();
                return Err(e);
            }
        }

        info!(
            core_workers = pool.config.core_worker_count,
            max_workers = pool.config.max_worker_count,
            max_queue_depth = pool.config.max_queue_depth,
            "WorkerPool initialized"
        );

        Ok(pool)
    }

    /// Submit a job for execution.
    ///
    /// The enqueue itself never blocks; it fails immediately if the queue is
    /// full or the pool is shut down.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the job queue is full
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    pub(crate) fn execute(&self, job: PoolJob) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::PoolShutdown);
        }

        {
            let job_tx = self.job_tx.lock();
            let Some(job_tx) = job_tx.as_ref() else {
                self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::PoolShutdown);
            };

            match job_tx.try_send(job) {
                Ok(()) => {
                    self.counters.submitted_jobs.fetch_add(1, Ordering::Relaxed);
                    self.counters.queued_jobs.fetch_add(1, Ordering::Relaxed);
                }
                Err(TrySendError::Full(_)) => {
                    self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
                    warn!(max_queue_depth = self.config.max_queue_depth, "Worker pool queue is full");
                    return Err(PoolError::QueueFull);
                }
                Err(TrySendError::Disconnected(_)) => {
                    self.counters.rejected_jobs.fetch_add(1, Ordering::Relaxed);
                    return Err(PoolError::PoolShutdown);
                }
            }
        }

        self.grow_if_starved();
        Ok(())
    }

    /// Spawn a surplus worker if queued jobs outnumber idle workers.
    fn grow_if_starved(&self) {
        let backlog = self.job_rx.len();
        let idle = self.counters.idle_workers.load(Ordering::Acquire);
        if backlog <= idle {
            return;
        }

        let reserved = self
            .counters
            .live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_worker_count).then_some(live + 1)
            })
            .is_ok();
        if !reserved {
            debug!(backlog, "Worker pool at max_worker_count; job waits for a free worker");
            return;
        }

        if let Err(e) = self.spawn_worker(Some(self.config.keep_alive())) {
            self.counters.live_workers.fetch_sub(1, Ordering::AcqRel);
            error!(error = %e, "Failed to spawn surplus worker");
        }
    }

    /// Spawn a worker thread. `keep_alive` is `None` for core workers.
    fn spawn_worker(&self, keep_alive: Option<Duration>) -> Result<(), PoolError> {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let job_rx = self.job_rx.clone();
        let counters = Arc::clone(&self.counters);

        let handle = thread::Builder::new()
            .name(format!("{}-{worker_id}", self.config.thread_name_prefix))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || worker_loop(worker_id, &job_rx, &counters, keep_alive))
            .map_err(|e| PoolError::Internal(format!("failed to spawn worker thread: {e}")))?;

        let mut workers = self.workers.lock();
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
        Ok(())
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Shut down the pool gracefully with timeout.
    ///
    /// This drops the job sender so workers drain the queue and exit, then
    /// attempts to join all workers (2 seconds per worker). Workers that
    /// don't exit within the timeout are detached to prevent hangs.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down worker pool");

        {
            let mut job_tx = self.job_tx.lock();
            *job_tx = None;
        }

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let worker_count = workers.len();

        for (idx, worker) in workers.into_iter().enumerate() {
            if worker.thread().id() == thread::current().id() {
                // shutdown called from inside a job; this worker exits on its own
                continue;
            }
            let (tx, rx) = std::sync::mpsc::channel();
            let join_thread = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(Duration::from_secs(2)) {
                Ok(true) => {
                    debug!(worker_id = idx, "Worker joined successfully");
                }
                Ok(false) => {
                    warn!(worker_id = idx, "Worker panicked");
                }
                Err(_) => {
                    warn!(worker_id = idx, "Worker did not exit within timeout - detaching");
                    continue;
                }
            }

            let _ = join_thread.join();
        }

        info!(worker_count = worker_count, "Worker pool shut down complete");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Signal shutdown but DON'T join workers in Drop
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            let mut job_tx = self.job_tx.lock();
            *job_tx = None;
            debug!("WorkerPool dropped without explicit shutdown - workers will be detached");
        }
    }
}

fn worker_loop(
    worker_id: usize,
    job_rx: &Receiver<PoolJob>,
    counters: &PoolCounters,
    keep_alive: Option<Duration>,
) {
    debug!(worker_id = worker_id, surplus = keep_alive.is_some(), "Worker thread started");

    loop {
        counters.idle_workers.fetch_add(1, Ordering::AcqRel);
        let job = match keep_alive {
            None => job_rx.recv().ok(),
            Some(keep_alive) => loop {
                match job_rx.recv_timeout(keep_alive) {
                    Ok(job) => break Some(job),
                    // a job may have slipped in while timing out
                    Err(RecvTimeoutError::Timeout) if !job_rx.is_empty() => {}
                    Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break None,
                }
            },
        };
        counters.idle_workers.fetch_sub(1, Ordering::AcqRel);

        let Some(job) = job else {
            break;
        };

        counters.queued_jobs.fetch_sub(1, Ordering::Relaxed);
        counters.active_jobs.fetch_add(1, Ordering::Relaxed);

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            counters.panicked_jobs.fetch_add(1, Ordering::Relaxed);
            error!(worker_id = worker_id, "Job panicked on worker thread");
        }

        counters.active_jobs.fetch_sub(1, Ordering::Relaxed);
        counters.completed_jobs.fetch_add(1, Ordering::Relaxed);
    }

    counters.live_workers.fetch_sub(1, Ordering::AcqRel);
    debug!(worker_id = worker_id, "Worker thread exiting");
}
