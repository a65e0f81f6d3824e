//! Task-aware counting semaphore

use super::{LockId, WaitSlot};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

struct State {
    /// Permits not held by anyone
    permits: usize,
    /// FIFO queue of blocked acquisitions
    waiters: VecDeque<Arc<WaitSlot>>,
}

/// Counting semaphore that suspends tasks instead of threads.
///
/// Permits released while tasks are queued go straight to the head of the
/// queue, so the available count only grows when nobody is waiting.
pub struct Semaphore {
    id: LockId,
    max_permits: usize,
    state: Mutex<State>,
}

impl Semaphore {
    /// Create a new semaphore with the given number of permits
    pub fn new(permits: usize) -> Self {
        Self {
            id: LockId::next(),
            max_permits: permits,
            state: Mutex::new(State {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Get the semaphore ID
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Get the current number of available permits
    pub fn available_permits(&self) -> usize {
        self.state.lock().permits
    }

    /// Get the maximum number of permits
    pub fn max_permits(&self) -> usize {
        self.max_permits
    }

    /// Get number of waiting tasks
    pub fn waiting_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Take a permit if one is free, without suspending
    pub fn try_acquire(&self) -> Option<SemaphorePermit<'_>> {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            Some(SemaphorePermit { sem: self })
        } else {
            None
        }
    }

    /// Suspend until a permit is available
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        AcquirePermit {
            sem: self,
            slot: None,
            done: false,
        }
        .await;
        SemaphorePermit { sem: self }
    }

    /// Like [`acquire`](Self::acquire), but the permit keeps the semaphore
    /// alive and can be moved into a spawned task.
    pub async fn acquire_owned(self: Arc<Self>) -> OwnedPermit {
        AcquirePermit {
            sem: &self,
            slot: None,
            done: false,
        }
        .await;
        OwnedPermit { sem: self }
    }

    fn release(&self) {
        let next = {
            let mut state = self.state.lock();
            self.hand_off(&mut state)
        };
        if let Some(slot) = next {
            slot.wake_soon();
        }
    }

    fn hand_off(&self, state: &mut State) -> Option<Arc<WaitSlot>> {
        match state.waiters.pop_front() {
            Some(slot) => {
                tracing::trace!(semaphore = %self.id, "handing permit to waiter");
                slot.grant();
                Some(slot)
            }
            None => {
                state.permits = (state.permits + 1).min(self.max_permits);
                None
            }
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Semaphore")
            .field("id", &self.id)
            .field("permits", &state.permits)
            .field("max_permits", &self.max_permits)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

struct AcquirePermit<'a> {
    sem: &'a Semaphore,
    slot: Option<Arc<WaitSlot>>,
    done: bool,
}

impl Future for AcquirePermit<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.done {
            return Poll::Ready(());
        }
        if let Some(slot) = &self.slot {
            slot.register(cx.waker());
            if slot.is_granted() {
                self.done = true;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        let mut state = self.sem.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            drop(state);
            self.done = true;
            return Poll::Ready(());
        }
        let slot = WaitSlot::new();
        slot.register(cx.waker());
        state.waiters.push_back(slot.clone());
        drop(state);
        self.slot = Some(slot);
        Poll::Pending
    }
}

impl Drop for AcquirePermit<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        if self.done {
            return;
        }
        let next = {
            let mut state = self.sem.state.lock();
            if slot.is_granted() {
                self.sem.hand_off(&mut state)
            } else {
                state.waiters.retain(|w| !Arc::ptr_eq(w, &slot));
                None
            }
        };
        if let Some(next) = next {
            next.wake_soon();
        }
    }
}

/// Permit borrowed from a [`Semaphore`]; released on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl fmt::Debug for SemaphorePermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePermit").field("semaphore", &self.sem.id).finish()
    }
}

/// Permit that owns a reference to its [`Semaphore`]; released on drop
#[must_use = "the permit is released as soon as it is dropped"]
pub struct OwnedPermit {
    sem: Arc<Semaphore>,
}

impl OwnedPermit {
    /// The semaphore this permit belongs to
    pub fn semaphore(&self) -> &Arc<Semaphore> {
        &self.sem
    }
}

impl Drop for OwnedPermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl fmt::Debug for OwnedPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnedPermit").field("semaphore", &self.sem.id).finish()
    }
}
