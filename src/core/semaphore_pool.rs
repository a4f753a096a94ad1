//! Registry of mutex semaphores, one per active owner key.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::core::semaphore::{Acquisition, ChangeSignal, MutexSemaphore};
use crate::core::task::{OwnerKey, QueuePosition, Task, TaskId};
use crate::util::clock::Deadline;

/// Owner key to semaphore map.
///
/// Entries are created on first use and removed as soon as a release leaves
/// a semaphore without owner and queue, so memory is bounded by the owners
/// that are currently active. Every semaphore operation runs under the map's
/// read lock and removal takes the write lock, so no task can reach a
/// semaphore that has just been unlinked.
///
/// Tasks parked on a blocking condition hold no permit; they are tracked in
/// a separate set so that visiting and idle detection still see them.
pub(crate) struct MutexSemaphorePool<K: OwnerKey> {
    semaphores: RwLock<HashMap<K, Arc<MutexSemaphore<K>>>>,
    blocked: Mutex<HashMap<TaskId, Arc<Task<K>>>>,
    rejecting: AtomicBool,
    changed: Arc<ChangeSignal>,
}

impl<K: OwnerKey> MutexSemaphorePool<K> {
    pub(crate) fn new(changed: Arc<ChangeSignal>) -> Self {
        Self {
            semaphores: RwLock::new(HashMap::new()),
            blocked: Mutex::new(HashMap::new()),
            rejecting: AtomicBool::new(false),
            changed,
        }
    }

    /// Signal shared with every semaphore and task of this pool.
    pub(crate) fn changed(&self) -> Arc<ChangeSignal> {
        Arc::clone(&self.changed)
    }

    pub(crate) fn try_acquire_else_offer_tail(&self, task: &Arc<Task<K>>) -> Acquisition {
        self.try_acquire_else_offer(task, QueuePosition::Tail)
    }

    pub(crate) fn try_acquire_else_offer_head(&self, task: &Arc<Task<K>>) -> Acquisition {
        self.try_acquire_else_offer(task, QueuePosition::Head)
    }

    /// Acquire the mutex of the task's owner key or queue the task. Once the
    /// pool is rejecting, the task is marked rejected and no entry is created.
    fn try_acquire_else_offer(&self, task: &Arc<Task<K>>, position: QueuePosition) -> Acquisition {
        if self.is_rejecting() {
            task.reject("scheduler is shut down");
            return Acquisition::Rejected;
        }

        let key = task.owner_key();
        {
            let semaphores = self.semaphores.read();
            if let Some(semaphore) = semaphores.get(key) {
                return Self::outcome(semaphore.try_acquire_else_offer(task, position));
            }
        }

        let mut semaphores = self.semaphores.write();
        // re-check under the write lock; shutdown may have started meanwhile
        if self.is_rejecting() {
            drop(semaphores);
            task.reject("scheduler is shut down");
            return Acquisition::Rejected;
        }
        let semaphore = semaphores
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MutexSemaphore::new(key.clone(), Arc::clone(&self.changed))));
        Self::outcome(semaphore.try_acquire_else_offer(task, position))
    }

    const fn outcome(acquired: bool) -> Acquisition {
        if acquired {
            Acquisition::Acquired
        } else {
            Acquisition::Queued
        }
    }

    /// Release the mutex owned by `task` and return the next owner, if any.
    ///
    /// A release by a task that is not the owner is logged and ignored.
    pub(crate) fn release_and_poll(&self, task: &Arc<Task<K>>) -> Option<Arc<Task<K>>> {
        let key = task.owner_key();
        let (next, drained) = {
            let semaphores = self.semaphores.read();
            let Some(semaphore) = semaphores.get(key) else {
                if self.is_rejecting() {
                    tracing::debug!(owner = ?key, task_id = task.id(), "release after shutdown ignored");
                } else {
                    tracing::error!(
                        owner = ?key,
                        task_id = task.id(),
                        "invariant violation: release for an owner key without semaphore"
                    );
                }
                task.set_holds_mutex(false);
                return None;
            };
            if !semaphore.is_owner(task) {
                tracing::error!(
                    owner = ?key,
                    task_id = task.id(),
                    "invariant violation: release by a task that is not the mutex owner"
                );
                return None;
            }
            let next = semaphore.release_and_poll();
            let drained = next.is_none().then(|| Arc::clone(semaphore));
            (next, drained)
        };

        if let Some(semaphore) = drained {
            let mut semaphores = self.semaphores.write();
            let still_ours = semaphores
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &semaphore));
            if still_ours && semaphore.is_idle() {
                semaphores.remove(key);
                tracing::trace!(owner = ?key, "semaphore drained and removed");
            }
        }
        next
    }

    /// Whether a semaphore entry exists for `key`.
    pub(crate) fn contains(&self, key: &K) -> bool {
        self.semaphores.read().contains_key(key)
    }

    /// Number of live semaphore entries.
    pub(crate) fn len(&self) -> usize {
        self.semaphores.read().len()
    }

    pub(crate) fn is_rejecting(&self) -> bool {
        self.rejecting.load(Ordering::Acquire)
    }

    /// Start rejecting, then reset every live semaphore. Returns the tasks
    /// that were owning or queued so the caller can cancel them.
    pub(crate) fn shutdown(&self) -> Vec<Arc<Task<K>>> {
        self.rejecting.store(true, Ordering::Release);
        let semaphores: Vec<_> = {
            let mut map = self.semaphores.write();
            map.drain().map(|(_, semaphore)| semaphore).collect()
        };
        let drained: Vec<_> = semaphores.iter().flat_map(|semaphore| semaphore.reset()).collect();
        self.changed.notify();
        drained
    }

    /// Track `task` as parked on a blocking condition.
    pub(crate) fn register_blocked(&self, task: &Arc<Task<K>>) {
        self.blocked.lock().insert(task.id(), Arc::clone(task));
        self.changed.notify();
    }

    pub(crate) fn unregister_blocked(&self, task: &Arc<Task<K>>) {
        self.blocked.lock().remove(&task.id());
        self.changed.notify();
    }

    pub(crate) fn is_blocked(&self, task: &Arc<Task<K>>) -> bool {
        self.blocked.lock().contains_key(&task.id())
    }

    fn live_semaphores(&self) -> Vec<Arc<MutexSemaphore<K>>> {
        self.semaphores.read().values().cloned().collect()
    }

    fn blocked_tasks(&self) -> Vec<Arc<Task<K>>> {
        self.blocked.lock().values().cloned().collect()
    }

    /// Point-in-time copy of every owning, queued and blocked task.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Task<K>>> {
        let mut tasks: Vec<_> = self
            .live_semaphores()
            .iter()
            .flat_map(|semaphore| semaphore.snapshot())
            .collect();
        tasks.extend(self.blocked_tasks());
        tasks
    }

    /// Call `visitor` on every live task matching `predicate` until it
    /// returns `false`. Returns `false` if the visit was stopped early.
    pub(crate) fn visit<P, V>(&self, predicate: P, mut visitor: V) -> bool
    where
        P: Fn(&Arc<Task<K>>) -> bool,
        V: FnMut(&Arc<Task<K>>) -> bool,
    {
        for task in self.snapshot() {
            if task.state().is_terminal() || !predicate(&task) {
                continue;
            }
            if !visitor(&task) {
                return false;
            }
        }
        true
    }

    /// True if no live task matches `predicate`.
    pub(crate) fn is_empty<P>(&self, predicate: P) -> bool
    where
        P: Fn(&Arc<Task<K>>) -> bool,
    {
        self.live_semaphores()
            .iter()
            .all(|semaphore| semaphore.is_empty(&predicate))
            && !self
                .blocked_tasks()
                .iter()
                .any(|task| !task.state().is_terminal() && predicate(task))
    }

    /// Block until no live task matches `predicate`, or `deadline` passes.
    pub(crate) fn wait_until_empty<P>(&self, predicate: P, deadline: Deadline) -> bool
    where
        P: Fn(&Arc<Task<K>>) -> bool,
    {
        self.changed.wait_until(deadline, || self.is_empty(&predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::testing::bare_task;
    use crate::core::task::TaskState;
    use std::time::Duration;

    fn pool() -> MutexSemaphorePool<&'static str> {
        MutexSemaphorePool::new(Arc::new(ChangeSignal::new()))
    }

    #[test]
    fn test_entry_created_lazily_and_removed_when_drained() {
        let pool = pool();
        let a = bare_task("s1", 1);
        let b = bare_task("s1", 2);
        assert!(!pool.contains(&"s1"));

        assert_eq!(pool.try_acquire_else_offer_tail(&a), Acquisition::Acquired);
        assert_eq!(pool.try_acquire_else_offer_tail(&b), Acquisition::Queued);
        assert!(pool.contains(&"s1"));

        let next = pool.release_and_poll(&a).unwrap();
        assert!(Arc::ptr_eq(&next, &b));
        assert!(pool.contains(&"s1"));

        assert!(pool.release_and_poll(&b).is_none());
        assert!(!pool.contains(&"s1"));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_owner_keys_are_independent() {
        let pool = pool();
        let a = bare_task("s1", 1);
        let b = bare_task("s2", 2);
        assert_eq!(pool.try_acquire_else_offer_tail(&a), Acquisition::Acquired);
        assert_eq!(pool.try_acquire_else_offer_tail(&b), Acquisition::Acquired);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let pool = pool();
        let a = bare_task("s1", 1);
        let b = bare_task("s1", 2);
        pool.try_acquire_else_offer_tail(&a);
        pool.try_acquire_else_offer_tail(&b);

        assert!(pool.release_and_poll(&b).is_none());
        assert!(a.holds_mutex());
        let next = pool.release_and_poll(&a).unwrap();
        assert!(Arc::ptr_eq(&next, &b));
    }

    #[test]
    fn test_release_without_entry_is_ignored() {
        let pool = pool();
        let a = bare_task("s1", 1);
        assert!(pool.release_and_poll(&a).is_none());
    }

    #[test]
    fn test_shutdown_rejects_without_creating_entries() {
        let pool = pool();
        let a = bare_task("s1", 1);
        let b = bare_task("s1", 2);
        pool.try_acquire_else_offer_tail(&a);
        pool.try_acquire_else_offer_tail(&b);

        let drained = pool.shutdown();
        assert_eq!(drained.len(), 2);
        assert_eq!(pool.len(), 0);

        let c = bare_task("s3", 3);
        assert_eq!(pool.try_acquire_else_offer_tail(&c), Acquisition::Rejected);
        assert_eq!(c.state(), TaskState::Rejected);
        assert!(!pool.contains(&"s3"));
    }

    #[test]
    fn test_visit_and_emptiness() {
        let pool = pool();
        let a = bare_task("s1", 1);
        let b = bare_task("s2", 2);
        pool.try_acquire_else_offer_tail(&a);
        pool.try_acquire_else_offer_tail(&b);

        let mut seen = Vec::new();
        assert!(pool.visit(|_| true, |task| {
            seen.push(task.id());
            true
        }));
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2]);

        assert!(!pool.is_empty(|task| *task.owner_key() == "s2"));
        assert!(pool.is_empty(|task| *task.owner_key() == "s9"));
        assert!(!pool.wait_until_empty(|_| true, Deadline::after(Duration::from_millis(20))));
    }

    #[test]
    fn test_blocked_tasks_count_as_live() {
        let pool = pool();
        let a = bare_task("s1", 1);
        pool.try_acquire_else_offer_tail(&a);
        pool.release_and_poll(&a);
        assert!(pool.is_empty(|_| true));

        pool.register_blocked(&a);
        assert!(pool.is_blocked(&a));
        assert!(!pool.is_empty(|_| true));
        assert_eq!(pool.snapshot().len(), 1);

        pool.unregister_blocked(&a);
        assert!(pool.is_empty(|_| true));
    }

    #[test]
    fn test_wait_until_empty_wakes_on_release() {
        let pool = Arc::new(pool());
        let a = bare_task("s1", 1);
        pool.try_acquire_else_offer_tail(&a);

        let releaser = Arc::clone(&pool);
        let released = Arc::clone(&a);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            releaser.release_and_poll(&released);
        });

        assert!(pool.wait_until_empty(|_| true, Deadline::after(Duration::from_secs(5))));
        handle.join().unwrap();
    }
}
