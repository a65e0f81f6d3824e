//! Run work while holding a set of locks

use super::{PriorityGuard, PriorityLock};
use std::future::Future;

/// Guards in acquisition order; dropped newest first
struct HeldLocks<'a> {
    guards: Vec<PriorityGuard<'a>>,
}

impl Drop for HeldLocks<'_> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Run `work` with every lock in `locks` held.
///
/// Locks are taken in ascending [`LockId`](super::LockId) order, whatever
/// order the slice lists them in, so two callers naming the same locks
/// cannot deadlock each other. A lock listed twice is taken once. The locks
/// are released in reverse order when `work` returns, panics, or the task is
/// killed.
pub async fn synchronized<F, T>(locks: &[&PriorityLock], work: F) -> T
where
    F: Future<Output = T>,
{
    let mut ordered: Vec<&PriorityLock> = locks.to_vec();
    ordered.sort_by_key(|lock| lock.id());
    ordered.dedup_by_key(|lock| lock.id());

    let mut held = HeldLocks {
        guards: Vec::with_capacity(ordered.len()),
    };
    for lock in ordered {
        held.guards.push(lock.lock().await);
    }
    let value = work.await;
    drop(held);
    value
}
