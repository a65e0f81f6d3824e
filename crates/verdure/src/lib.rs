//! Verdure: cooperative task toolkit
//!
//! This crate provides green-task concurrency on a single-threaded hub:
//! - **Hub**: Scheduler, tasks, timers and clocks (`hub` module)
//! - **Sync**: Priority lock, reader-writer lock, semaphores (`sync` module)
//! - **Group**: Pool-bounded task groups (`group` module)
//! - **Futurist**: Futures, executors and wait combinators (`futurist` module)
//! - **Config**: Hub configuration loaded from TOML (`config` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use verdure::{Executor, GreenThreadPoolExecutor, Hub, HubConfig};
//! use std::time::Duration;
//!
//! let hub = Hub::new(HubConfig::default());
//! let answer = hub.run(async {
//!     let executor = GreenThreadPoolExecutor::new(4);
//!     let fut = executor.submit(async { 6 * 7 }).await.unwrap();
//!     fut.result(Some(Duration::from_secs(1))).await
//! });
//! assert_eq!(answer, Ok(Ok(42)));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Core Modules
// ============================================================================

/// Config module: Hub settings and TOML loading
pub mod config;

/// Hub module: Scheduler, tasks and timers
pub mod hub;

/// Sync module: Task-aware locks and semaphores
pub mod sync;

/// Group module: Bounded task groups
pub mod group;

/// Futurist module: Futures, executors and combinators
pub mod futurist;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ClockMode, ConfigError, HubConfig};

pub use hub::{
    // Scheduler
    Handle, Hub, HubError, HubStats,
    // Tasks
    Task, TaskError, TaskExit, TaskHandle, TaskId, TaskState,
    // Timers
    TimerHandle,
    // Free functions
    current_task, schedule, sleep, spawn, switch_to, yield_now,
};

pub use sync::{
    DummyLock, LockError, LockId, NamedSemaphore, Owner, PriorityGuard, PriorityLock,
    ReadGuard, ReaderWriterLock, Semaphore, Semaphores, WriteGuard, synchronized,
};

pub use group::ThreadGroup;

pub use futurist::{
    Executor, ExecutorError, Future, FutureError, FutureState, GreenThreadPoolExecutor,
    SynchronousExecutor, WaitResult, future_wait, wait_for_all, wait_for_any,
};
