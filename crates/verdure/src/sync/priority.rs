//! Task-aware lock that serves waiters by priority
//!
//! Lower numbers are served first. Waiters with equal priority are served
//! in arrival order. On release the lock is handed straight to the best
//! waiter, so a task that shows up between the release and the waiter's
//! resumption cannot take it.

use super::{LockError, LockId, WaitSlot};
use crate::hub::{self, TaskId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Blocked acquisition in the waiter heap
struct Waiter {
    priority: i32,
    seq: u64,
    task: Option<TaskId>,
    slot: Arc<WaitSlot>,
}

// Reverse ordering for min-heap (lowest priority, then lowest seq, first)
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

struct State {
    locked: bool,
    default_priority: i32,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

/// Mutual-exclusion lock with prioritized waiters
pub struct PriorityLock {
    id: LockId,
    state: Mutex<State>,
}

impl PriorityLock {
    /// Create an unlocked lock with default priority 0
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(State {
                locked: false,
                default_priority: 0,
                waiters: BinaryHeap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Lock identity
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Whether some task holds the lock
    pub fn locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of blocked acquisitions
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Priority used by [`acquire`](Self::acquire) and [`lock`](Self::lock)
    pub fn default_priority(&self) -> i32 {
        self.state.lock().default_priority
    }

    /// Change the default priority. Only allowed while the lock is free.
    pub fn set_default_priority(&self, priority: i32) -> Result<(), LockError> {
        let mut state = self.state.lock();
        if state.locked {
            return Err(LockError::PriorityWhileHeld(self.id));
        }
        state.default_priority = priority;
        Ok(())
    }

    /// Acquire with the default priority.
    ///
    /// Resolves to `true` once the caller holds the lock. Resolves to `false`
    /// without acquiring when the calling task is already queued on this lock.
    pub fn acquire(&self) -> Acquire<'_> {
        let priority = self.default_priority();
        self.acquire_with_priority(priority)
    }

    /// Acquire with an explicit priority. See [`acquire`](Self::acquire).
    pub fn acquire_with_priority(&self, priority: i32) -> Acquire<'_> {
        Acquire {
            lock: self,
            priority,
            slot: None,
            done: false,
        }
    }

    /// Release the lock, handing it to the best waiter if there is one.
    pub fn release(&self) -> Result<(), LockError> {
        let next = {
            let mut state = self.state.lock();
            if !state.locked {
                return Err(LockError::NotHeld(self.id));
            }
            self.hand_off(&mut state)
        };
        if let Some(slot) = next {
            slot.wake_soon();
        }
        Ok(())
    }

    /// Scoped acquisition at `priority`. The guard releases on drop.
    pub async fn priority(&self, priority: i32) -> PriorityGuard<'_> {
        let armed = self.acquire_with_priority(priority).await;
        PriorityGuard { lock: self, armed }
    }

    /// Scoped acquisition at the default priority
    pub async fn lock(&self) -> PriorityGuard<'_> {
        let armed = self.acquire().await;
        PriorityGuard { lock: self, armed }
    }

    /// Pass ownership to the best waiter, or unlock. Returns the slot to wake.
    fn hand_off(&self, state: &mut State) -> Option<Arc<WaitSlot>> {
        match state.waiters.pop() {
            Some(waiter) => {
                tracing::debug!(
                    lock = %self.id,
                    priority = waiter.priority,
                    task = ?waiter.task,
                    "handing lock to waiter"
                );
                waiter.slot.grant();
                Some(waiter.slot)
            }
            None => {
                state.locked = false;
                None
            }
        }
    }
}

impl Default for PriorityLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PriorityLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PriorityLock")
            .field("id", &self.id)
            .field("locked", &state.locked)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Future returned by [`PriorityLock::acquire`]
pub struct Acquire<'a> {
    lock: &'a PriorityLock,
    priority: i32,
    slot: Option<Arc<WaitSlot>>,
    done: bool,
}

impl Future for Acquire<'_> {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        if self.done {
            return Poll::Ready(true);
        }
        if let Some(slot) = &self.slot {
            slot.register(cx.waker());
            if slot.is_granted() {
                self.done = true;
                return Poll::Ready(true);
            }
            return Poll::Pending;
        }

        let lock = self.lock;
        let mut state = lock.state.lock();
        if !state.locked {
            state.locked = true;
            self.done = true;
            return Poll::Ready(true);
        }

        let task = hub::current_task_id();
        if task.is_some() && state.waiters.iter().any(|w| w.task == task) {
            tracing::trace!(lock = %lock.id, ?task, "task already waiting on lock");
            return Poll::Ready(false);
        }

        let slot = WaitSlot::new();
        slot.register(cx.waker());
        let seq = state.next_seq;
        state.next_seq += 1;
        state.waiters.push(Waiter {
            priority: self.priority,
            seq,
            task,
            slot: slot.clone(),
        });
        drop(state);
        self.slot = Some(slot);
        Poll::Pending
    }
}

impl Drop for Acquire<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        if self.done {
            return;
        }
        let next = {
            let mut state = self.lock.state.lock();
            if slot.is_granted() {
                // Handed over but never observed: pass it on.
                self.lock.hand_off(&mut state)
            } else {
                state.waiters.retain(|w| !Arc::ptr_eq(&w.slot, &slot));
                None
            }
        };
        if let Some(next) = next {
            next.wake_soon();
        }
    }
}

/// Releases a [`PriorityLock`] when dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct PriorityGuard<'a> {
    lock: &'a PriorityLock,
    armed: bool,
}

impl PriorityGuard<'_> {
    /// Whether this guard actually holds the lock. False when the
    /// acquisition was a duplicate request.
    pub fn holds(&self) -> bool {
        self.armed
    }
}

impl Drop for PriorityGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.lock.release() {
                tracing::warn!(%err, "guard released a lock it did not hold");
            }
        }
    }
}

/// Lock with the [`PriorityLock`] surface that never blocks
#[derive(Debug, Default)]
pub struct DummyLock;

impl DummyLock {
    /// Create a dummy lock
    pub fn new() -> Self {
        DummyLock
    }

    /// Always false
    pub fn locked(&self) -> bool {
        false
    }

    /// Accepted and ignored
    pub fn set_default_priority(&self, _priority: i32) -> Result<(), LockError> {
        Ok(())
    }

    /// Resolves immediately
    pub async fn acquire(&self) -> bool {
        true
    }

    /// Resolves immediately
    pub async fn acquire_with_priority(&self, _priority: i32) -> bool {
        true
    }

    /// Always succeeds
    pub fn release(&self) -> Result<(), LockError> {
        Ok(())
    }

    /// Scoped no-op acquisition
    pub async fn priority(&self, _priority: i32) -> DummyGuard {
        DummyGuard
    }

    /// Scoped no-op acquisition
    pub async fn lock(&self) -> DummyGuard {
        DummyGuard
    }
}

/// Guard returned by [`DummyLock`]
#[derive(Debug)]
pub struct DummyGuard;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use std::time::Duration;

    fn hub() -> Hub {
        Hub::new(HubConfig::virtual_clock())
    }

    #[test]
    fn test_free_lock_is_taken_without_suspending() {
        hub()
            .run(async {
                let lock = PriorityLock::new();
                assert!(lock.acquire().await);
                assert!(lock.locked());
                lock.release().unwrap();
                assert!(!lock.locked());
            })
            .unwrap();
    }

    #[test]
    fn test_release_unheld_is_error() {
        let lock = PriorityLock::new();
        assert_eq!(lock.release(), Err(LockError::NotHeld(lock.id())));
    }

    #[test]
    fn test_set_default_priority_while_held() {
        hub()
            .run(async {
                let lock = PriorityLock::new();
                lock.set_default_priority(2).unwrap();
                assert_eq!(lock.default_priority(), 2);
                let _guard = lock.lock().await;
                assert_eq!(
                    lock.set_default_priority(0),
                    Err(LockError::PriorityWhileHeld(lock.id()))
                );
            })
            .unwrap();
    }

    #[test]
    fn test_waiters_served_by_priority_then_fifo() {
        let order = hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                let log = Arc::new(Mutex::new(Vec::new()));
                let guard = lock.lock().await;

                let mut handles = Vec::new();
                for (name, priority) in [("a", 5), ("b", 1), ("c", 5), ("d", 0)] {
                    let lock = lock.clone();
                    let log = log.clone();
                    handles.push(hub::spawn(async move {
                        let _guard = lock.priority(priority).await;
                        log.lock().push(name);
                        hub::yield_now().await;
                    }));
                }
                hub::yield_now().await;
                assert_eq!(lock.waiters(), 4);
                drop(guard);

                for handle in handles {
                    handle.wait().await.unwrap();
                }
                assert!(!lock.locked());
                let order = log.lock().clone();
                order
            })
            .unwrap();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
    }

    #[test]
    fn test_release_does_not_switch_directly() {
        hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                let reached = Arc::new(Mutex::new(false));
                lock.acquire().await;

                let waiter = {
                    let lock = lock.clone();
                    let reached = reached.clone();
                    hub::spawn(async move {
                        let _guard = lock.lock().await;
                        *reached.lock() = true;
                    })
                };
                hub::yield_now().await;
                lock.release().unwrap();
                // Ownership moved, but the waiter has not run yet.
                assert!(lock.locked());
                assert!(!*reached.lock());
                waiter.wait().await.unwrap();
                assert!(*reached.lock());
            })
            .unwrap();
    }

    #[test]
    fn test_no_barging_after_handoff() {
        let order = hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                let log = Arc::new(Mutex::new(Vec::new()));
                lock.acquire().await;

                let waiter = {
                    let (lock, log) = (lock.clone(), log.clone());
                    hub::spawn(async move {
                        let _guard = lock.lock().await;
                        log.lock().push("waiter");
                    })
                };
                hub::yield_now().await;
                lock.release().unwrap();

                // Arrives after the release but before the waiter resumes.
                let late = {
                    let (lock, log) = (lock.clone(), log.clone());
                    hub::spawn(async move {
                        let _guard = lock.lock().await;
                        log.lock().push("late");
                    })
                };
                waiter.wait().await.unwrap();
                late.wait().await.unwrap();
                let order = log.lock().clone();
                order
            })
            .unwrap();
        assert_eq!(order, vec!["waiter", "late"]);
    }

    #[test]
    fn test_killed_waiter_leaves_queue() {
        hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                let guard = lock.lock().await;
                let waiter = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.lock().await;
                    })
                };
                hub::yield_now().await;
                assert_eq!(lock.waiters(), 1);
                waiter.kill().unwrap();
                assert_eq!(lock.waiters(), 0);
                drop(guard);
                assert!(!lock.locked());
            })
            .unwrap();
    }

    #[test]
    fn test_granted_then_killed_waiter_passes_lock_on() {
        hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                lock.acquire().await;
                let first = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.priority(0).await;
                    })
                };
                let second = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.priority(1).await;
                        7
                    })
                };
                hub::yield_now().await;
                lock.release().unwrap();
                first.kill().unwrap();
                assert_eq!(second.wait().await, Ok(7));
                assert!(!lock.locked());
            })
            .unwrap();
    }

    #[test]
    fn test_guard_releases_when_holder_killed() {
        hub()
            .run(async {
                let lock = Arc::new(PriorityLock::new());
                let holder = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.lock().await;
                        hub::sleep(Duration::from_secs(60)).await;
                    })
                };
                hub::yield_now().await;
                assert!(lock.locked());
                holder.kill().unwrap();
                assert!(!lock.locked());
            })
            .unwrap();
    }

    #[test]
    fn test_dummy_lock_never_blocks() {
        hub()
            .run(async {
                let lock = DummyLock::new();
                let _a = lock.lock().await;
                let _b = lock.priority(3).await;
                assert!(lock.acquire().await);
                assert!(!lock.locked());
                assert_eq!(lock.release(), Ok(()));
            })
            .unwrap();
    }
}
