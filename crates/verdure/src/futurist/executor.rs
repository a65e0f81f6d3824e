//! Executors that turn work into [`Future`]s

use super::{Future, FutureError};
use crate::config::HubConfig;
use crate::group::ThreadGroup;
use crate::sync::Semaphore;
use std::fmt;
use std::future::Future as StdFuture;
use std::sync::atomic::{AtomicBool, Ordering};

/// Errors raised by executors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// `submit` after `shutdown`
    #[error("can not schedule new futures after being shutdown")]
    Shutdown,

    /// Linking the submitted work failed
    #[error(transparent)]
    Future(#[from] FutureError),
}

/// Common surface of the executors
#[allow(async_fn_in_trait)]
pub trait Executor {
    /// Turn `work` into a future the executor drives
    async fn submit<F, T>(&self, work: F) -> Result<Future<T>, ExecutorError>
    where
        F: StdFuture<Output = T> + Send + 'static,
        T: Send + 'static;

    /// Stop accepting work; with `wait`, let submitted work finish,
    /// otherwise kill it
    async fn shutdown(&self, wait: bool);

    /// Whether `submit` is still accepted
    fn alive(&self) -> bool;
}

/// Runs each submission in its own task, at most `max_workers` at a time
pub struct GreenThreadPoolExecutor {
    max_workers: usize,
    pool: ThreadGroup,
    shutdown_lock: Semaphore,
    shutdown: AtomicBool,
}

impl GreenThreadPoolExecutor {
    /// Create an executor running at most `max_workers` tasks at once
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            pool: ThreadGroup::new(max_workers),
            shutdown_lock: Semaphore::new(1),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Executor sized by `default_max_workers`
    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.default_max_workers)
    }

    /// Configured worker limit
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// The group running the submitted work
    pub fn pool(&self) -> &ThreadGroup {
        &self.pool
    }
}

impl Executor for GreenThreadPoolExecutor {
    async fn submit<F, T>(&self, work: F) -> Result<Future<T>, ExecutorError>
    where
        F: StdFuture<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _guard = self.shutdown_lock.acquire().await;
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ExecutorError::Shutdown);
        }
        let future = Future::new(work);
        future.link(Some(&self.pool)).await?;
        Ok(future)
    }

    async fn shutdown(&self, wait: bool) {
        let _guard = self.shutdown_lock.acquire().await;
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            tracing::debug!(wait, live = self.pool.len(), "shutting down executor");
            self.pool.stop(wait).await;
        }
    }

    fn alive(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }
}

impl fmt::Debug for GreenThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GreenThreadPoolExecutor")
            .field("max_workers", &self.max_workers)
            .field("alive", &self.alive())
            .field("pool", &self.pool)
            .finish()
    }
}

/// Runs each submission to completion inside `submit`
#[derive(Debug, Default)]
pub struct SynchronousExecutor {
    shutdown: AtomicBool,
}

impl SynchronousExecutor {
    /// Create a new executor
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for SynchronousExecutor {
    async fn submit<F, T>(&self, work: F) -> Result<Future<T>, ExecutorError>
    where
        F: StdFuture<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ExecutorError::Shutdown);
        }
        let future = Future::new(work);
        future.run_inline().await;
        Ok(future)
    }

    async fn shutdown(&self, _wait: bool) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn alive(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{self, Handle, Hub};
    use std::time::Duration;

    fn hub() -> Hub {
        Hub::new(HubConfig::virtual_clock())
    }

    #[test]
    fn test_submit_and_result() {
        hub()
            .run(async {
                let executor = GreenThreadPoolExecutor::new(4);
                let fut = executor
                    .submit(async {
                        hub::sleep(Duration::from_millis(2)).await;
                        "done"
                    })
                    .await
                    .unwrap();
                assert!(fut.linked());
                assert_eq!(fut.result(None).await, Ok("done"));
                assert!(executor.pool().is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_submit_after_shutdown() {
        hub()
            .run(async {
                let executor = GreenThreadPoolExecutor::new(4);
                assert!(executor.alive());
                executor.shutdown(true).await;
                assert!(!executor.alive());
                let err = executor.submit(async {}).await.unwrap_err();
                assert_eq!(err, ExecutorError::Shutdown);
            })
            .unwrap();
    }

    #[test]
    fn test_graceful_shutdown_waits() {
        hub()
            .run(async {
                let executor = GreenThreadPoolExecutor::new(4);
                let fut = executor
                    .submit(async { hub::sleep(Duration::from_secs(3)).await })
                    .await
                    .unwrap();
                let start = Handle::current().now();
                executor.shutdown(true).await;
                assert_eq!(Handle::current().now() - start, Duration::from_secs(3));
                assert!(fut.finished());
            })
            .unwrap();
    }

    #[test]
    fn test_hard_shutdown_cancels() {
        hub()
            .run(async {
                let executor = GreenThreadPoolExecutor::new(4);
                let fut = executor
                    .submit(async { hub::sleep(Duration::from_secs(3)).await })
                    .await
                    .unwrap();
                hub::yield_now().await;
                executor.shutdown(false).await;
                assert_eq!(fut.result(None).await, Err(FutureError::Cancelled));
            })
            .unwrap();
    }

    #[test]
    fn test_pool_limit_queues_submissions() {
        hub()
            .run(async {
                let executor = GreenThreadPoolExecutor::new(1);
                let start = Handle::current().now();
                let first = executor
                    .submit(async { hub::sleep(Duration::from_secs(1)).await })
                    .await
                    .unwrap();
                let second = executor.submit(async { 2 }).await.unwrap();
                assert!(first.finished());
                assert_eq!(Handle::current().now() - start, Duration::from_secs(1));
                assert_eq!(second.result(None).await, Ok(2));
            })
            .unwrap();
    }

    #[test]
    fn test_from_config() {
        let executor = GreenThreadPoolExecutor::from_config(&HubConfig::default());
        assert_eq!(executor.max_workers(), 1000);
        assert_eq!(executor.pool().pool_size(), 1000);
    }

    #[test]
    fn test_synchronous_executor_resolves_inline() {
        hub()
            .run(async {
                let executor = SynchronousExecutor::new();
                let fut = executor.submit(async { 6 * 7 }).await.unwrap();
                assert!(fut.finished());
                assert!(fut.task().is_none());
                assert_eq!(fut.result(Some(Duration::ZERO)).await, Ok(42));

                executor.shutdown(false).await;
                assert!(!executor.alive());
                assert_eq!(executor.submit(async {}).await.unwrap_err(), ExecutorError::Shutdown);
            })
            .unwrap();
    }
}
