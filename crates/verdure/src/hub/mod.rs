//! Cooperative task hub
//!
//! Single reactor-less loop that polls one task at a time and fires timers
//! between polls. Everything else in the crate suspends through it.
//!
//! Components:
//! - `task`      : Task core, handles, links, kill
//! - `timer`     : Deadline heap with sequence tie-breaking
//! - `scheduler` : Hub, Handle, run loop, clocks

mod scheduler;
mod task;
mod timer;

pub use scheduler::{Handle, Hub, HubError, HubStats, Sleep, YieldNow};
pub use task::{Join, LinkKey, Task, TaskError, TaskExit, TaskHandle, TaskId, TaskState};
pub use timer::TimerHandle;

pub(crate) use scheduler::{current_task_id, panic_message};

use std::future::Future;
use std::time::Duration;

/// Spawn a task on the current hub.
///
/// # Panics
///
/// Panics when called outside of [`Hub::run`].
pub fn spawn<F, T>(future: F) -> TaskHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    Handle::current().spawn(future)
}

/// Run `callback` after `delay` on the current hub.
pub fn schedule<C>(delay: Duration, callback: C) -> TimerHandle
where
    C: FnOnce() + Send + 'static,
{
    Handle::current().schedule(delay, callback)
}

/// Suspend the current task for `delay`.
pub fn sleep(delay: Duration) -> Sleep {
    Sleep::new(delay)
}

/// Let every other ready task run once before continuing.
pub fn yield_now() -> YieldNow {
    YieldNow::new()
}

/// Hand control to `task` before anything else in the run queue.
pub fn switch_to(task: &Task) -> YieldNow {
    Handle::current().switch_to(task)
}

/// The task being polled right now, if called from inside a hub.
pub fn current_task() -> Option<Task> {
    Handle::try_current().and_then(|handle| handle.current_task())
}
