//! Futures, executors and wait combinators built on the hub
//!
//! A [`Future`] is deferred work plus a settled-once result slot. Executors
//! turn work into linked futures; [`wait_for_any`] and [`wait_for_all`]
//! suspend until enough of a set has settled.

mod executor;
mod future;
mod rendezvous;
mod wait;

pub use executor::{Executor, ExecutorError, GreenThreadPoolExecutor, SynchronousExecutor};
pub use future::{CallbackKey, Future, FutureState};
pub use wait::{future_wait, wait_for_all, wait_for_any, WaitResult};

/// Errors reported by [`Future`] handles and combinators
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    /// The deadline passed before the future settled
    #[error("future fetch result timeout")]
    Timeout,

    /// The future was canceled or its task was killed
    #[error("future has been canceled")]
    Cancelled,

    /// The work panicked
    #[error("future work failed: {0}")]
    Failed(String),

    /// `link` was called a second time
    #[error("future is already linked to a task")]
    AlreadyLinked,

    /// The result was requested before the work was started
    #[error("future has not been linked to a task")]
    NotLinked,

    /// `cancel` on a settled future
    #[error("work has already finished")]
    AlreadyFinished,
}
