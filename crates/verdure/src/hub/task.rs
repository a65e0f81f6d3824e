//! Green task representation and handles
//!
//! A task is a boxed future owned by the hub. Handles are cheap clones of
//! the shared [`TaskCore`]; they can wait on the task, kill it, and attach
//! completion callbacks (links) that fire once when the task ends.

use super::scheduler::{self, Shared};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

/// Type-erased task body. The typed result is written to a side slot.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type LinkFn = Box<dyn FnOnce(&TaskExit) + Send>;

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Currently being polled by the hub
    Running,
    /// Waiting at a suspension point (or not yet started)
    Suspended,
    /// Ran to completion, or panicked
    Finished,
    /// Dropped at a suspension point by `kill()`
    Killed,
}

impl TaskState {
    /// Whether the task can no longer run
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Killed)
    }
}

/// How a task ended. Passed to every link callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskExit {
    /// The body returned normally
    Finished,
    /// The body panicked with the given message
    Panicked(String),
    /// The task was killed
    Killed,
}

/// Errors reported by task handles
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Uncaught panic inside the task, re-raised to the waiter
    #[error("task panicked: {0}")]
    Panicked(String),

    /// The task was killed before it finished
    #[error("task was killed")]
    Killed,

    /// kill() on a task that already ended
    #[error("task has already finished")]
    AlreadyFinished,

    /// A task tried to wait on itself
    #[error("task {0} cannot wait on itself")]
    WaitOnSelf(TaskId),
}

impl TaskExit {
    /// Map the exit onto the result `wait()` reports
    pub fn to_result(&self) -> Result<(), TaskError> {
        match self {
            TaskExit::Finished => Ok(()),
            TaskExit::Panicked(msg) => Err(TaskError::Panicked(msg.clone())),
            TaskExit::Killed => Err(TaskError::Killed),
        }
    }
}

/// Token returned by [`Task::link`], used to remove the callback again
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey(u64);

/// Shared task state. Owned by the hub's task table and by every handle.
pub(crate) struct TaskCore {
    id: TaskId,
    state: Mutex<TaskState>,
    /// Body; taken out while being polled and dropped when the task ends
    future: Mutex<Option<BoxFuture>>,
    exit: Mutex<Option<TaskExit>>,
    links: Mutex<Vec<(LinkKey, LinkFn)>>,
    next_link: AtomicU64,
    /// Wakers of tasks blocked in `wait()`
    joiners: Mutex<Vec<Waker>>,
    pub(crate) kill_requested: AtomicBool,
    /// Set while the task sits in a run queue
    pub(crate) queued: AtomicBool,
    hub: Weak<Shared>,
}

impl TaskCore {
    pub(crate) fn new(id: TaskId, future: BoxFuture, hub: Weak<Shared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(TaskState::Suspended),
            future: Mutex::new(Some(future)),
            exit: Mutex::new(None),
            links: Mutex::new(Vec::new()),
            next_link: AtomicU64::new(1),
            joiners: Mutex::new(Vec::new()),
            kill_requested: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            hub,
        })
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        *self.state.lock() = state;
    }

    pub(crate) fn take_future(&self) -> Option<BoxFuture> {
        self.future.lock().take()
    }

    pub(crate) fn restore_future(&self, future: BoxFuture) {
        *self.future.lock() = Some(future);
    }

    pub(crate) fn hub(&self) -> Option<Arc<Shared>> {
        self.hub.upgrade()
    }

    pub(crate) fn exit(&self) -> Option<TaskExit> {
        self.exit.lock().clone()
    }

    /// Record the exit, fire links in registration order, then wake joiners.
    ///
    /// Idempotent: only the first call has any effect.
    pub(crate) fn finish(self: &Arc<Self>, exit: TaskExit) {
        {
            let mut slot = self.exit.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(exit.clone());
        }
        self.set_state(match exit {
            TaskExit::Killed => TaskState::Killed,
            _ => TaskState::Finished,
        });
        tracing::trace!(task = %self.id, ?exit, "task ended");

        let links = std::mem::take(&mut *self.links.lock());
        for (_, callback) in links {
            callback(&exit);
        }

        let joiners = std::mem::take(&mut *self.joiners.lock());
        for waker in joiners {
            waker.wake();
        }

        if let Some(hub) = self.hub() {
            hub.retire(self.id, &exit);
        }
    }
}

/// Waker that re-enqueues a task on its hub.
pub(crate) struct TaskWaker {
    pub(crate) task: Arc<TaskCore>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(hub) = self.task.hub() {
            hub.enqueue(&self.task);
        }
    }
}

/// Untyped handle to a spawned task.
#[derive(Clone)]
pub struct Task {
    pub(crate) core: Arc<TaskCore>,
}

impl Task {
    /// Task identity
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Whether the task has ended (finished, panicked, or killed)
    pub fn is_finished(&self) -> bool {
        self.core.state().is_terminal()
    }

    /// How the task ended, if it has
    pub fn exit(&self) -> Option<TaskExit> {
        self.core.exit()
    }

    /// Register a callback invoked once when the task ends.
    ///
    /// If the task has already ended the callback runs immediately.
    pub fn link<F>(&self, callback: F) -> LinkKey
    where
        F: FnOnce(&TaskExit) + Send + 'static,
    {
        let key = LinkKey(self.core.next_link.fetch_add(1, Ordering::Relaxed));
        if let Some(exit) = self.core.exit() {
            callback(&exit);
            return key;
        }
        self.core.links.lock().push((key, Box::new(callback)));
        key
    }

    /// Remove a link before it fires. Returns false if it already fired
    /// or was never registered.
    pub fn unlink(&self, key: LinkKey) -> bool {
        let mut links = self.core.links.lock();
        match links.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                links.remove(index);
                true
            }
            None => false,
        }
    }

    /// Forcibly terminate the task.
    ///
    /// A suspended task is dropped right away: its scope guards run now and
    /// its links fire before this returns. A task killing itself keeps
    /// running until its next suspension point.
    pub fn kill(&self) -> Result<(), TaskError> {
        let core = &self.core;
        if core.exit().is_some() {
            return Err(TaskError::AlreadyFinished);
        }
        if core.kill_requested.swap(true, Ordering::AcqRel) {
            // Already being torn down further up the stack.
            return Ok(());
        }
        if scheduler::current_task_id() == Some(core.id) {
            tracing::trace!(task = %core.id, "kill requested by the task itself");
            return Ok(());
        }

        tracing::trace!(task = %core.id, "killing task");
        if let Some(future) = core.take_future() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(future))) {
                tracing::warn!(
                    task = %core.id,
                    panic = %scheduler::panic_message(payload.as_ref()),
                    "task panicked while being dropped"
                );
            }
        }
        core.finish(TaskExit::Killed);
        Ok(())
    }

    /// Suspend the caller until the task ends.
    ///
    /// Resolves to `Err(Panicked)` if the task panicked and to
    /// `Err(Killed)` if it was killed.
    pub fn wait(&self) -> Join {
        Join {
            core: self.core.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id)
            .field("state", &self.core.state())
            .finish()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for Task {}

/// Future returned by [`Task::wait`].
pub struct Join {
    core: Arc<TaskCore>,
}

impl Future for Join {
    type Output = Result<(), TaskError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(exit) = self.core.exit() {
            return Poll::Ready(exit.to_result());
        }
        if scheduler::current_task_id() == Some(self.core.id) {
            return Poll::Ready(Err(TaskError::WaitOnSelf(self.core.id)));
        }
        let mut joiners = self.core.joiners.lock();
        if !joiners.iter().any(|w| w.will_wake(cx.waker())) {
            joiners.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Typed handle returned by `spawn`.
///
/// Derefs to the untyped [`Task`] for kill/link/unlink.
pub struct TaskHandle<T> {
    task: Task,
    result: Arc<Mutex<Option<T>>>,
}

impl<T> TaskHandle<T> {
    pub(crate) fn new(task: Task, result: Arc<Mutex<Option<T>>>) -> Self {
        Self { task, result }
    }

    /// The untyped task behind this handle
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub(crate) fn take_result(&self) -> Option<T> {
        self.result.lock().take()
    }
}

impl<T: Clone> TaskHandle<T> {
    /// Wait for the task and return its value. May be called repeatedly.
    pub async fn wait(&self) -> Result<T, TaskError> {
        self.task.wait().await?;
        self.result
            .lock()
            .clone()
            .ok_or_else(|| TaskError::Panicked("task ended without a result".to_string()))
    }
}

impl<T> Clone for TaskHandle<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            result: self.result.clone(),
        }
    }
}

impl<T> std::ops::Deref for TaskHandle<T> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.task.fmt(f)
    }
}
