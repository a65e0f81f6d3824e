//! Handle to the eventual result of a unit of work
//!
//! A [`Future`] wraps work that has not started yet. `link` starts it in a
//! task, alone or inside a [`ThreadGroup`]. Completion is recorded on the
//! handle itself, so any number of clones can read the result, wait for it
//! with a deadline, or cancel the work.

use super::rendezvous::{Outcome, Rendezvous};
use super::FutureError;
use crate::group::ThreadGroup;
use crate::hub::{self, Task, TaskExit, TimerHandle};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future as StdFuture;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

type Work<T> = Pin<Box<dyn StdFuture<Output = T> + Send>>;
type DoneCallback = Box<dyn FnOnce() + Send>;

/// Lifecycle of a [`Future`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FutureState {
    /// Not started, or still running
    Pending,
    /// The work returned or panicked
    Finished,
    /// Cancelled, or its task was killed
    Canceled,
}

/// Token returned by [`Future::add_done_callback`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct CallbackKey(u64);

struct Slot<T> {
    state: FutureState,
    /// Value, or the message of a panic raised by the work
    outcome: Option<Result<T, String>>,
    work: Option<Work<T>>,
    task: Option<Task>,
    linked: bool,
    callbacks: Vec<(CallbackKey, DoneCallback)>,
    next_callback: u64,
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
}

impl<T> Inner<T> {
    /// Settle a pending future and fire its callbacks. No-op once settled.
    fn complete(&self, state: FutureState, outcome: Option<Result<T, String>>) {
        let (callbacks, work) = {
            let mut slot = self.slot.lock();
            if slot.state != FutureState::Pending {
                return;
            }
            slot.state = state;
            slot.outcome = outcome;
            (std::mem::take(&mut slot.callbacks), slot.work.take())
        };
        drop(work);
        for (_, callback) in callbacks {
            callback();
        }
    }
}

/// Cheap clonable handle to deferred work producing `T`
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T: Send + 'static> Future<T> {
    /// Wrap `work` without starting it
    pub fn new<F>(work: F) -> Self
    where
        F: StdFuture<Output = T> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: FutureState::Pending,
                    outcome: None,
                    work: Some(Box::pin(work)),
                    task: None,
                    linked: false,
                    callbacks: Vec::new(),
                    next_callback: 1,
                }),
            }),
        }
    }

    /// Start the work in a new task, inside `pool` if given.
    ///
    /// Suspends while the pool is full. A killed task marks the future
    /// canceled.
    pub async fn link(&self, pool: Option<&ThreadGroup>) -> Result<(), FutureError> {
        {
            let mut slot = self.inner.slot.lock();
            if slot.linked {
                return Err(FutureError::AlreadyLinked);
            }
            slot.linked = true;
        }
        let mut linking = Linking {
            inner: &self.inner,
            armed: true,
        };

        let body = run_work(Arc::downgrade(&self.inner));
        let task = match pool {
            Some(pool) => pool.add_thread(body).await.task().clone(),
            None => hub::spawn(body).task().clone(),
        };
        linking.armed = false;

        let weak = Arc::downgrade(&self.inner);
        task.link(move |exit| {
            let Some(inner) = weak.upgrade() else { return };
            match exit {
                TaskExit::Killed => inner.complete(FutureState::Canceled, None),
                TaskExit::Panicked(message) => {
                    inner.complete(FutureState::Finished, Some(Err(message.clone())))
                }
                TaskExit::Finished => {}
            }
        });
        self.inner.slot.lock().task = Some(task);
        Ok(())
    }

    /// Run the work to completion in the calling task
    pub(crate) async fn run_inline(&self) {
        self.inner.slot.lock().linked = true;
        run_work(Arc::downgrade(&self.inner)).await;
    }

    /// Cancel the work and kill its task.
    ///
    /// Waiters see [`FutureError::Cancelled`]. Fails with
    /// [`FutureError::AlreadyFinished`] once the future has settled.
    pub fn cancel(&self) -> Result<(), FutureError> {
        let task = {
            let slot = self.inner.slot.lock();
            if slot.state != FutureState::Pending {
                return Err(FutureError::AlreadyFinished);
            }
            slot.task.clone()
        };
        self.inner.complete(FutureState::Canceled, None);
        if let Some(task) = task {
            tracing::trace!(task = %task.id(), "cancelling future");
            // AlreadyFinished is fine: the state is settled either way.
            let _ = task.kill();
        }
        Ok(())
    }
}

impl<T> Future<T> {
    /// Current state
    pub fn state(&self) -> FutureState {
        self.inner.slot.lock().state
    }

    /// Whether the work produced a value or panicked
    pub fn finished(&self) -> bool {
        self.state() == FutureState::Finished
    }

    /// Whether the future was canceled
    pub fn canceled(&self) -> bool {
        self.state() == FutureState::Canceled
    }

    /// Whether the future has settled either way
    pub fn done(&self) -> bool {
        self.state() != FutureState::Pending
    }

    /// Whether `link` (or an executor) has taken the work
    pub fn linked(&self) -> bool {
        self.inner.slot.lock().linked
    }

    /// Task running the work, once started
    pub fn task(&self) -> Option<Task> {
        self.inner.slot.lock().task.clone()
    }

    /// Call `callback` once the future settles.
    ///
    /// Runs it immediately and returns `None` if it already has.
    pub fn add_done_callback<C>(&self, callback: C) -> Option<CallbackKey>
    where
        C: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();
        if slot.state != FutureState::Pending {
            drop(slot);
            callback();
            return None;
        }
        let key = CallbackKey(slot.next_callback);
        slot.next_callback += 1;
        slot.callbacks.push((key, Box::new(callback)));
        Some(key)
    }

    /// Remove a callback that has not fired. Returns false otherwise.
    pub fn remove_done_callback(&self, key: CallbackKey) -> bool {
        let mut slot = self.inner.slot.lock();
        match slot.callbacks.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                slot.callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_callbacks(&self) -> usize {
        self.inner.slot.lock().callbacks.len()
    }

    /// Equal if both handles refer to the same future
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Clone> Future<T> {
    /// The result of a settled future, without waiting
    fn settled(&self) -> Option<Result<T, FutureError>> {
        let slot = self.inner.slot.lock();
        match slot.state {
            FutureState::Pending => None,
            FutureState::Canceled => Some(Err(FutureError::Cancelled)),
            FutureState::Finished => Some(match &slot.outcome {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(message)) => Err(FutureError::Failed(message.clone())),
                None => Err(FutureError::Failed("work ended without a result".to_string())),
            }),
        }
    }

    /// Wait for the result, at most `timeout` if given.
    ///
    /// Reads are repeatable. On timeout the work keeps running.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<T, FutureError> {
        if let Some(result) = self.settled() {
            return result;
        }
        if !self.linked() {
            return Err(FutureError::NotLinked);
        }

        let rv = Rendezvous::new(1);
        let key = {
            let rv = rv.clone();
            self.add_done_callback(move || rv.hit())
        };
        let timer = timeout.map(|timeout| {
            let rv = rv.clone();
            hub::schedule(timeout, move || rv.time_out())
        });
        let registrations = Registrations {
            future: self,
            key,
            timer,
        };

        let outcome = rv.wait().await;
        drop(registrations);
        if outcome == Outcome::TimedOut {
            if let Some(result) = self.settled() {
                return result;
            }
            return Err(FutureError::Timeout);
        }
        self.settled().unwrap_or(Err(FutureError::Cancelled))
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for Future<T> {}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("Future")
            .field("state", &slot.state)
            .field("linked", &slot.linked)
            .field("task", &slot.task.as_ref().map(Task::id))
            .finish()
    }
}

/// Task body: run the work, capture a panic, settle the future.
async fn run_work<T: Send + 'static>(inner: Weak<Inner<T>>) {
    let work = match inner.upgrade() {
        Some(inner) => inner.slot.lock().work.take(),
        None => None,
    };
    let Some(work) = work else { return };
    let outcome = CatchUnwind { work }.await;
    if let Some(inner) = inner.upgrade() {
        inner.complete(FutureState::Finished, Some(outcome));
    }
}

/// Polls the work and turns a panic into `Err(message)`
struct CatchUnwind<T> {
    work: Work<T>,
}

impl<T> StdFuture for CatchUnwind<T> {
    type Output = Result<T, String>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let work = self.work.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| work.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => Poll::Ready(Ok(value)),
            Err(payload) => {
                let message = hub::panic_message(payload.as_ref());
                tracing::debug!(panic = %message, "future work panicked");
                Poll::Ready(Err(message))
            }
        }
    }
}

/// Resets `linked` if `link` is abandoned before the task exists
struct Linking<'a, T> {
    inner: &'a Arc<Inner<T>>,
    armed: bool,
}

impl<T> Drop for Linking<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.slot.lock().linked = false;
        }
    }
}

/// Done callback and timer registered by `result`; both removed on drop
struct Registrations<'a, T> {
    future: &'a Future<T>,
    key: Option<CallbackKey>,
    timer: Option<TimerHandle>,
}

impl<T> Drop for Registrations<'_, T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.future.remove_done_callback(key);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
