//! Timer thread that holds delayed jobs until their delay elapses.
//!
//! Entries arrive over a channel and wait in a min-heap keyed by due time.
//! The thread sleeps on the channel until the earliest entry is due, so a
//! delayed job never occupies a worker thread while it waits.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::core::worker_pool::PoolError;

/// How an entry left the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    /// Its due time passed.
    Due,
    /// The timer shut down first.
    Discarded,
}

/// Runs exactly once, on the timer thread or on the thread that found the
/// timer shut down.
pub(crate) type TimerAction = Box<dyn FnOnce(Expiry) + Send + 'static>;

struct Entry {
    due: Instant,
    seq: u64,
    action: TimerAction,
}

// Reversed for a min-heap; equal due times keep submission order
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

pub(crate) struct DelayTimer {
    entry_tx: Mutex<Option<Sender<Entry>>>,
    next_seq: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DelayTimer {
    /// Start the timer thread.
    pub(crate) fn new(thread_name: String) -> Result<Self, PoolError> {
        let (entry_tx, entry_rx) = unbounded();
        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || timer_loop(&entry_rx))
            .map_err(|e| PoolError::Internal(format!("failed to spawn timer thread: {e}")))?;

        Ok(Self {
            entry_tx: Mutex::new(Some(entry_tx)),
            next_seq: AtomicU64::new(0),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `action` with [`Expiry::Due`] once `due` passes. After shutdown
    /// the action runs at once, on the calling thread, with
    /// [`Expiry::Discarded`].
    pub(crate) fn schedule(&self, due: Instant, action: TimerAction) {
        let entry = Entry {
            due,
            seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
            action,
        };
        let refused = match self.entry_tx.lock().as_ref() {
            Some(entry_tx) => entry_tx.send(entry).err().map(|e| e.into_inner()),
            None => Some(entry),
        };
        if let Some(entry) = refused {
            fire(entry, Expiry::Discarded);
        }
    }

    /// Stop the thread, discarding every entry that is not yet due. Returns
    /// once every discarded action has run.
    pub(crate) fn shutdown(&self) {
        self.entry_tx.lock().take();
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            warn!("Timer thread panicked");
        }
    }
}

fn timer_loop(entry_rx: &Receiver<Entry>) {
    let mut pending: BinaryHeap<Entry> = BinaryHeap::new();

    loop {
        let received = match pending.peek() {
            Some(next) => entry_rx.recv_deadline(next.due),
            None => entry_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(entry) => pending.push(entry),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while pending.peek().is_some_and(|next| next.due <= now) {
            if let Some(entry) = pending.pop() {
                fire(entry, Expiry::Due);
            }
        }
    }

    debug!(discarded = pending.len(), "Timer stopped");
    for entry in pending.into_sorted_vec().into_iter().rev() {
        fire(entry, Expiry::Discarded);
    }
}

fn fire(entry: Entry, expiry: Expiry) {
    if catch_unwind(AssertUnwindSafe(|| (entry.action)(expiry))).is_err() {
        error!(?expiry, "Timer action panicked");
    }
}
