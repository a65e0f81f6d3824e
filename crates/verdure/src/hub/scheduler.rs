//! Single-threaded cooperative hub
//!
//! One task is polled at a time. Between two polls the hub fires every
//! timer that is due, so a zero-delay callback always runs after the task
//! that scheduled it has yielded, and never before an earlier registration.

use super::task::{BoxFuture, Task, TaskCore, TaskExit, TaskHandle, TaskId, TaskState, TaskWaker};
use super::timer::{TimerHandle, TimerQueue};
use crate::config::{ClockMode, HubConfig};
use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

thread_local! {
    static CURRENT_HUB: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Errors returned by [`Hub::run`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Nothing is runnable, no timer is armed, and the main task is still
    /// waiting
    #[error("deadlock: main task is blocked with {live_tasks} live task(s) and no pending timers")]
    Deadlock {
        /// Tasks still alive when the hub gave up
        live_tasks: usize,
    },

    /// The main task panicked
    #[error("main task panicked: {0}")]
    MainPanicked(String),

    /// The main task was killed
    #[error("main task was killed")]
    MainKilled,

    /// `run` was called while a hub is already running on this thread
    #[error("a hub is already running on this thread")]
    AlreadyRunning,
}

/// Hub statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Total tasks spawned
    pub tasks_spawned: u64,

    /// Tasks that returned normally
    pub tasks_finished: u64,

    /// Tasks that panicked
    pub tasks_panicked: u64,

    /// Tasks that were killed
    pub tasks_killed: u64,

    /// Timer callbacks that ran
    pub timers_fired: u64,

    /// Tasks currently alive
    pub live_tasks: usize,
}

/// Source of hub-relative time
pub(crate) enum Clock {
    Monotonic { epoch: Instant },
    Virtual { now: Mutex<Duration> },
}

impl Clock {
    fn new(mode: ClockMode) -> Self {
        match mode {
            ClockMode::Monotonic => Clock::Monotonic {
                epoch: Instant::now(),
            },
            ClockMode::Virtual => Clock::Virtual {
                now: Mutex::new(Duration::ZERO),
            },
        }
    }

    pub(crate) fn now(&self) -> Duration {
        match self {
            Clock::Monotonic { epoch } => epoch.elapsed(),
            Clock::Virtual { now } => *now.lock(),
        }
    }

    /// Block until `deadline`. The monotonic clock sleeps the thread for at
    /// most `cap` per call; the virtual clock jumps straight there.
    fn idle_until(&self, deadline: Duration, cap: Duration) {
        match self {
            Clock::Monotonic { .. } => {
                let now = self.now();
                if deadline > now {
                    thread::sleep((deadline - now).min(cap));
                }
            }
            Clock::Virtual { now } => {
                let mut now = now.lock();
                if deadline > *now {
                    *now = deadline;
                }
            }
        }
    }
}

/// State shared between the hub, its handles, and task wakers
pub(crate) struct Shared {
    config: HubConfig,
    clock: Clock,
    /// FIFO run queue
    ready: Injector<Arc<TaskCore>>,
    /// Task to run before anything in `ready` (set by `switch_to`)
    next: Mutex<Option<Arc<TaskCore>>>,
    timers: Mutex<TimerQueue>,
    tasks: Mutex<FxHashMap<TaskId, Arc<TaskCore>>>,
    current: Mutex<Option<Arc<TaskCore>>>,
    stats: Mutex<HubStats>,
    running: AtomicBool,
}

impl Shared {
    /// Put a task on the run queue unless it is already there or has ended.
    pub(crate) fn enqueue(&self, task: &Arc<TaskCore>) {
        if task.state().is_terminal() {
            return;
        }
        if task.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.push(task.clone());
    }

    /// Drop a finished task from the table and count it.
    pub(crate) fn retire(&self, id: TaskId, exit: &TaskExit) {
        let removed = self.tasks.lock().remove(&id).is_some();
        let mut stats = self.stats.lock();
        match exit {
            TaskExit::Finished => stats.tasks_finished += 1,
            TaskExit::Panicked(_) => stats.tasks_panicked += 1,
            TaskExit::Killed => stats.tasks_killed += 1,
        }
        if removed {
            stats.live_tasks = stats.live_tasks.saturating_sub(1);
        }
    }

    fn schedule(&self, delay: Duration, callback: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let deadline = self.clock.now() + delay;
        self.timers.lock().push(deadline, callback)
    }

    fn pop_ready(&self) -> Option<Arc<TaskCore>> {
        if let Some(task) = self.next.lock().take() {
            return Some(task);
        }
        loop {
            match self.ready.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => return None,
                Steal::Retry => continue,
            }
        }
    }

    /// Run every timer due now that was registered before this call.
    fn fire_due_timers(&self) {
        let now = self.clock.now();
        let seq_limit = self.timers.lock().next_seq();
        loop {
            let entry = self.timers.lock().pop_due(now, seq_limit);
            let Some(entry) = entry else { break };
            if !entry.claim() {
                continue;
            }
            let callback = entry.into_callback();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
                tracing::error!(panic = %panic_message(payload.as_ref()), "timer callback panicked");
            }
            self.stats.lock().timers_fired += 1;
        }
    }

    /// Poll a task once and settle it if it ended.
    fn poll_task(&self, core: Arc<TaskCore>) {
        core.queued.store(false, Ordering::Release);
        let Some(mut future) = core.take_future() else {
            return;
        };
        core.set_state(TaskState::Running);
        let previous = self.current.lock().replace(core.clone());

        let waker = Waker::from(Arc::new(TaskWaker { task: core.clone() }));
        let mut cx = Context::from_waker(&waker);
        let polled = panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx)));

        let exit = match polled {
            Ok(Poll::Pending) if !core.kill_requested.load(Ordering::Acquire) => {
                core.set_state(TaskState::Suspended);
                core.restore_future(future);
                None
            }
            Ok(Poll::Pending) => {
                drop_body(core.id(), future);
                Some(TaskExit::Killed)
            }
            Ok(Poll::Ready(())) => {
                drop_body(core.id(), future);
                Some(TaskExit::Finished)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::debug!(task = %core.id(), panic = %message, "task panicked");
                drop_body(core.id(), future);
                Some(TaskExit::Panicked(message))
            }
        };

        *self.current.lock() = previous;
        if let Some(exit) = exit {
            core.finish(exit);
        }
    }

    fn live_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}

fn drop_body(id: TaskId, future: BoxFuture) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(future))) {
        tracing::warn!(task = %id, panic = %panic_message(payload.as_ref()), "task panicked while being dropped");
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Id of the task the hub on this thread is polling right now.
pub(crate) fn current_task_id() -> Option<TaskId> {
    CURRENT_HUB.with(|cell| {
        cell.borrow()
            .as_ref()
            .and_then(|shared| shared.current.lock().as_ref().map(|core| core.id()))
    })
}

/// Restores the previous thread-local hub when `run` returns or unwinds.
struct EnterGuard {
    previous: Option<Arc<Shared>>,
}

impl EnterGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        let previous = CURRENT_HUB.with(|cell| cell.borrow_mut().replace(shared.clone()));
        Self { previous }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_HUB.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// The scheduler. Owns every task spawned on it.
pub struct Hub {
    shared: Arc<Shared>,
}

impl Hub {
    /// Create a hub with the given configuration
    pub fn new(config: HubConfig) -> Self {
        let clock = Clock::new(config.clock);
        Self {
            shared: Arc::new(Shared {
                config,
                clock,
                ready: Injector::new(),
                next: Mutex::new(None),
                timers: Mutex::new(TimerQueue::default()),
                tasks: Mutex::new(FxHashMap::default()),
                current: Mutex::new(None),
                stats: Mutex::new(HubStats::default()),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Handle for spawning onto this hub from outside a task
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Snapshot of the hub counters
    pub fn stats(&self) -> HubStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.live_tasks = self.shared.live_tasks();
        stats
    }

    /// Run `main` as a task and drive the hub until it ends.
    ///
    /// Other tasks still suspended when `main` returns stay on the hub and
    /// continue on the next `run`, or are killed when the hub is dropped.
    pub fn run<F, T>(&self, main: F) -> Result<T, HubError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if current_task_id().is_some() || self.shared.running.swap(true, Ordering::AcqRel) {
            return Err(HubError::AlreadyRunning);
        }
        let _enter = EnterGuard::enter(&self.shared);
        let result = self.drive(main);
        self.shared.running.store(false, Ordering::Release);
        result
    }

    fn drive<F, T>(&self, main: F) -> Result<T, HubError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let shared = &self.shared;
        let main = self.handle().spawn(main);
        let cap = Duration::from_millis(shared.config.max_idle_sleep_ms);

        loop {
            shared.fire_due_timers();
            if let Some(task) = shared.pop_ready() {
                shared.poll_task(task);
                if main.is_finished() {
                    break;
                }
                continue;
            }
            if main.is_finished() {
                break;
            }
            let deadline = shared.timers.lock().next_deadline();
            match deadline {
                Some(deadline) => shared.clock.idle_until(deadline, cap),
                None => {
                    return Err(HubError::Deadlock {
                        live_tasks: shared.live_tasks(),
                    })
                }
            }
        }

        match main.exit() {
            Some(TaskExit::Panicked(message)) => Err(HubError::MainPanicked(message)),
            Some(TaskExit::Killed) => Err(HubError::MainKilled),
            _ => main.take_result().ok_or(HubError::MainKilled),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        // Tasks may hold handles back to the hub; kill them to break the cycle.
        let _enter = EnterGuard::enter(&self.shared);
        let remaining: Vec<_> = self.shared.tasks.lock().values().cloned().collect();
        for core in remaining {
            let _ = Task { core }.kill();
        }
        let timers = self.shared.timers.lock().clear();
        drop(timers);
        self.shared.next.lock().take();
        while self.shared.pop_ready().is_some() {}
    }
}

/// Cheap clonable reference to a hub
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Handle to the hub running on this thread.
    ///
    /// # Panics
    ///
    /// Panics when called outside of [`Hub::run`].
    pub fn current() -> Self {
        Self::try_current().unwrap_or_else(|| panic!("called outside of a running hub"))
    }

    /// Handle to the hub running on this thread, if any
    pub fn try_current() -> Option<Self> {
        CURRENT_HUB.with(|cell| cell.borrow().as_ref().map(|shared| Handle { shared: shared.clone() }))
    }

    /// Configuration the hub was built with
    pub fn config(&self) -> &HubConfig {
        &self.shared.config
    }

    /// Hub-relative time
    pub fn now(&self) -> Duration {
        self.shared.clock.now()
    }

    /// Spawn a task. It first runs after the caller yields.
    pub fn spawn<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let result = Arc::new(Mutex::new(None));
        let slot = result.clone();
        let body: BoxFuture = Box::pin(async move {
            let value = future.await;
            *slot.lock() = Some(value);
        });

        let id = TaskId::next();
        let core = TaskCore::new(id, body, Arc::downgrade(&self.shared));
        self.shared.tasks.lock().insert(id, core.clone());
        {
            let mut stats = self.shared.stats.lock();
            stats.tasks_spawned += 1;
            stats.live_tasks += 1;
        }
        tracing::trace!(task = %id, "spawned task");
        self.shared.enqueue(&core);
        TaskHandle::new(Task { core }, result)
    }

    /// Run `callback` after `delay`, from the hub loop.
    pub fn schedule<C>(&self, delay: Duration, callback: C) -> TimerHandle
    where
        C: FnOnce() + Send + 'static,
    {
        self.shared.schedule(delay, Box::new(callback))
    }

    /// The task being polled right now
    pub fn current_task(&self) -> Option<Task> {
        self.shared
            .current
            .lock()
            .as_ref()
            .map(|core| Task { core: core.clone() })
    }

    /// Make `task` the very next task to run and suspend the caller.
    ///
    /// Has no effect on a task that already ended.
    pub fn switch_to(&self, task: &Task) -> YieldNow {
        if !task.is_finished() && task.core.hub().is_some_and(|hub| Arc::ptr_eq(&hub, &self.shared)) {
            task.core.queued.store(true, Ordering::Release);
            *self.shared.next.lock() = Some(task.core.clone());
        }
        YieldNow { yielded: false }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("clock", &self.shared.config.clock)
            .field("live_tasks", &self.shared.live_tasks())
            .finish()
    }
}

/// Future returned by [`sleep`](super::sleep)
pub struct Sleep {
    delay: Duration,
    timer: Option<(TimerHandle, Arc<AtomicBool>)>,
}

impl Sleep {
    pub(crate) fn new(delay: Duration) -> Self {
        Self { delay, timer: None }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.timer {
            Some((_, fired)) => {
                if fired.load(Ordering::Acquire) {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            }
            None => {
                let fired = Arc::new(AtomicBool::new(false));
                let flag = fired.clone();
                let waker = cx.waker().clone();
                let timer = Handle::current().schedule(self.delay, move || {
                    flag.store(true, Ordering::Release);
                    waker.wake();
                });
                self.timer = Some((timer, fired));
                Poll::Pending
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some((timer, _)) = &self.timer {
            timer.cancel();
        }
    }
}

/// Future returned by [`yield_now`](super::yield_now) and [`Handle::switch_to`]
pub struct YieldNow {
    yielded: bool,
}

impl YieldNow {
    pub(crate) fn new() -> Self {
        Self { yielded: false }
    }
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
