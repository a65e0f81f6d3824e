//! Waiting on several futures at once

use super::rendezvous::Rendezvous;
use super::{CallbackKey, Future};
use crate::hub::{self, TimerHandle};
use std::fmt;
use std::time::Duration;

/// Partition returned by the wait combinators. Both sides keep input order.
pub struct WaitResult<T> {
    /// Futures that settled
    pub done: Vec<Future<T>>,
    /// Futures still pending
    pub not_done: Vec<Future<T>>,
}

impl<T> WaitResult<T> {
    fn partition(futures: &[Future<T>]) -> Self {
        let (done, not_done) = futures.iter().cloned().partition(settled);
        Self { done, not_done }
    }
}

/// Done, or never linked to a task and so never going to change
fn settled<T>(future: &Future<T>) -> bool {
    future.done() || !future.linked()
}

impl<T> fmt::Debug for WaitResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitResult")
            .field("done", &self.done.len())
            .field("not_done", &self.not_done.len())
            .finish()
    }
}

/// Callbacks and timer armed by `future_wait`; all removed on drop
struct Registrations<'a, T> {
    keys: Vec<(&'a Future<T>, CallbackKey)>,
    timer: Option<TimerHandle>,
}

impl<T> Drop for Registrations<'_, T> {
    fn drop(&mut self) {
        for (future, key) in self.keys.drain(..) {
            future.remove_done_callback(key);
        }
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Suspend until at least `ok_count` of `futures` have settled, or until
/// `timeout` passes.
///
/// A timeout is not an error: the partition tells what settled in time.
/// A future that was never linked counts as settled. `ok_count` is capped
/// at the number of futures.
pub async fn future_wait<T>(
    futures: &[Future<T>],
    timeout: Option<Duration>,
    ok_count: usize,
) -> WaitResult<T> {
    let ok_count = ok_count.min(futures.len());
    let initial = WaitResult::partition(futures);
    if initial.done.len() >= ok_count {
        return initial;
    }

    let rv = Rendezvous::new(ok_count - initial.done.len());
    let mut registrations = Registrations {
        keys: Vec::with_capacity(initial.not_done.len()),
        timer: None,
    };
    for future in futures.iter().filter(|future| !settled(future)) {
        let rv = rv.clone();
        if let Some(key) = future.add_done_callback(move || rv.hit()) {
            registrations.keys.push((future, key));
        }
    }
    registrations.timer = timeout.map(|timeout| {
        let rv = rv.clone();
        hub::schedule(timeout, move || rv.time_out())
    });

    let outcome = rv.wait().await;
    drop(registrations);
    let result = WaitResult::partition(futures);
    tracing::trace!(
        ?outcome,
        done = result.done.len(),
        not_done = result.not_done.len(),
        "future wait returned"
    );
    result
}

/// Suspend until one future settles or `timeout` passes
pub async fn wait_for_any<T>(
    futures: &[Future<T>],
    timeout: Option<Duration>,
) -> WaitResult<T> {
    future_wait(futures, timeout, 1).await
}

/// Suspend until every future settles or `timeout` passes
pub async fn wait_for_all<T>(
    futures: &[Future<T>],
    timeout: Option<Duration>,
) -> WaitResult<T> {
    future_wait(futures, timeout, futures.len()).await
}
