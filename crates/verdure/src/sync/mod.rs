//! Task-aware synchronization primitives
//!
//! Blocking here suspends the calling task, never the OS thread. Waiters
//! are granted ownership directly by the releasing side and resumed with a
//! zero-delay hub callback, so the releaser keeps running without nesting
//! the waiter's code on its stack.

mod priority;
mod registry;
mod rwlock;
mod semaphore;
mod synchronized;

pub use priority::{Acquire, DummyGuard, DummyLock, PriorityGuard, PriorityLock};
pub use registry::{NamedSemaphore, Semaphores};
pub use rwlock::{Owner, ReadGuard, ReaderWriterLock, WriteGuard};
pub use semaphore::{OwnedPermit, Semaphore, SemaphorePermit};
pub use synchronized::synchronized;

use crate::hub::Handle;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

/// Identity of a lock, semaphore or reader/writer lock.
///
/// Ids grow with creation order; [`synchronized`] takes locks in ascending
/// id order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockId(u64);

impl LockId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock#{}", self.0)
    }
}

/// Errors raised by lock protocol violations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// release() on a lock nobody holds
    #[error("lock {0} is not held")]
    NotHeld(LockId),

    /// A reader asked for the write lock
    #[error("reader to writer privilege escalation is not allowed on {0}")]
    Escalation(LockId),

    /// A pending writer asked for the read lock
    #[error("a pending writer cannot acquire the read lock on {0}")]
    PendingWriter(LockId),

    /// The default priority changed while the lock was held
    #[error("default priority of {0} can only change while it is free")]
    PriorityWhileHeld(LockId),

    /// Task identity is required but no task is running
    #[error("{0} must be used from inside a hub task")]
    OutsideTask(LockId),
}

/// Parking spot for one blocked acquisition.
///
/// The releasing side flips `granted` while holding the lock state, then
/// resumes the waiter from a zero-delay callback.
#[derive(Default)]
pub(crate) struct WaitSlot {
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl WaitSlot {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_granted(&self) -> bool {
        self.granted.load(Ordering::Acquire)
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut slot = self.waker.lock();
        match slot.as_ref() {
            Some(current) if current.will_wake(waker) => {}
            _ => *slot = Some(waker.clone()),
        }
    }

    /// Mark granted. The caller must hold the owning lock's state.
    pub(crate) fn grant(&self) {
        self.granted.store(true, Ordering::Release);
    }

    /// Resume the waiter once the current task yields.
    pub(crate) fn wake_soon(self: &Arc<Self>) {
        let slot = self.clone();
        let wake = move || {
            let waker = slot.waker.lock().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        };
        match Handle::try_current() {
            Some(handle) => {
                handle.schedule(Duration::ZERO, wake);
            }
            None => wake(),
        }
    }
}
