//! Bounded group of tasks
//!
//! A [`ThreadGroup`] caps how many of its tasks are alive at once and keeps
//! a live list that each task leaves when it ends, however it ends.

use crate::config::HubConfig;
use crate::hub::{self, Task, TaskError, TaskHandle, TaskId};
use crate::sync::Semaphore;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

struct GroupInner {
    pool: Arc<Semaphore>,
    threads: Mutex<Vec<Task>>,
}

impl GroupInner {
    fn thread_done(&self, id: TaskId) {
        self.threads.lock().retain(|task| task.id() != id);
    }
}

/// Pool-bounded set of tasks that can be waited on or stopped together
#[derive(Clone)]
pub struct ThreadGroup {
    inner: Arc<GroupInner>,
}

impl ThreadGroup {
    /// Create a group running at most `pool_size` tasks at once.
    ///
    /// A size of zero is raised to one.
    pub fn new(pool_size: usize) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                pool: Arc::new(Semaphore::new(pool_size.max(1))),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Group sized by `default_pool_size`
    pub fn from_config(config: &HubConfig) -> Self {
        Self::new(config.default_pool_size)
    }

    /// Maximum number of tasks alive at once
    pub fn pool_size(&self) -> usize {
        self.inner.pool.max_permits()
    }

    /// Number of live tasks
    pub fn len(&self) -> usize {
        self.inner.threads.lock().len()
    }

    /// Whether no task is alive
    pub fn is_empty(&self) -> bool {
        self.inner.threads.lock().is_empty()
    }

    /// Snapshot of the live tasks, in the order they were added
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.threads.lock().clone()
    }

    /// Spawn `work` in the group, suspending first while the pool is full.
    pub async fn add_thread<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.inner.pool.clone().acquire_owned().await;
        let handle = hub::spawn(async move {
            let _permit = permit;
            work.await
        });

        let id = handle.id();
        self.inner.threads.lock().push(handle.task().clone());
        let group = Arc::downgrade(&self.inner);
        handle.link(move |_| {
            if let Some(group) = group.upgrade() {
                group.thread_done(id);
            }
        });
        tracing::trace!(task = %id, live = self.len(), "added task to group");
        handle
    }

    /// Wait for every live task except the caller.
    ///
    /// Killed tasks are skipped quietly; other failures are logged.
    pub async fn wait(&self) {
        let current = hub::current_task_id();
        for task in self.tasks() {
            if Some(task.id()) == current {
                continue;
            }
            match task.wait().await {
                Ok(()) | Err(TaskError::Killed) => {}
                Err(err) => tracing::error!(task = %task.id(), %err, "error waiting on thread"),
            }
        }
    }

    /// Stop the group.
    ///
    /// With `graceful` this is [`wait`](Self::wait). Otherwise every live
    /// task except the caller is killed right away.
    pub async fn stop(&self, graceful: bool) {
        if graceful {
            self.wait().await;
            return;
        }
        let current = hub::current_task_id();
        for task in self.tasks() {
            if Some(task.id()) == current {
                continue;
            }
            match task.kill() {
                Ok(()) | Err(TaskError::AlreadyFinished) => {}
                Err(err) => tracing::error!(task = %task.id(), %err, "error stopping thread"),
            }
        }
    }
}

impl fmt::Debug for ThreadGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadGroup")
            .field("pool_size", &self.pool_size())
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Handle, Hub, TaskState};
    use std::time::Duration;

    fn hub() -> Hub {
        Hub::new(HubConfig::virtual_clock())
    }

    #[test]
    fn test_zero_pool_size_is_raised() {
        assert_eq!(ThreadGroup::new(0).pool_size(), 1);
        assert_eq!(ThreadGroup::from_config(&HubConfig::default()).pool_size(), 10);
    }

    #[test]
    fn test_finished_tasks_leave_the_group() {
        hub()
            .run(async {
                let group = ThreadGroup::new(4);
                let a = group.add_thread(async { 1 }).await;
                let b = group.add_thread(async { 2 }).await;
                assert_eq!(group.len(), 2);
                assert_eq!(a.wait().await, Ok(1));
                assert_eq!(b.wait().await, Ok(2));
                assert!(group.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_pool_bounds_concurrency() {
        hub()
            .run(async {
                let group = ThreadGroup::new(2);
                let start = Handle::current().now();
                for _ in 0..4 {
                    group
                        .add_thread(async { hub::sleep(Duration::from_secs(1)).await })
                        .await;
                }
                // The last two had to wait for a slot.
                assert_eq!(Handle::current().now() - start, Duration::from_secs(1));
                group.wait().await;
                assert_eq!(Handle::current().now() - start, Duration::from_secs(2));
                assert!(group.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_stop_kills_others_but_not_caller() {
        hub()
            .run(async {
                let group = ThreadGroup::new(10);
                let mut sleepers = Vec::new();
                for _ in 0..3 {
                    sleepers.push(
                        group
                            .add_thread(async { hub::sleep(Duration::from_secs(60)).await })
                            .await,
                    );
                }
                let inside = group.clone();
                let stopper = group
                    .add_thread(async move {
                        hub::yield_now().await;
                        inside.stop(false).await;
                        "survived"
                    })
                    .await;
                assert_eq!(stopper.wait().await, Ok("survived"));
                for sleeper in sleepers {
                    assert_eq!(sleeper.state(), TaskState::Killed);
                }
                assert!(group.is_empty());
            })
            .unwrap();
    }

    #[test]
    fn test_killed_task_frees_pool_slot() {
        hub()
            .run(async {
                let group = ThreadGroup::new(1);
                let blocker = group
                    .add_thread(async { hub::sleep(Duration::from_secs(60)).await })
                    .await;
                blocker.kill().unwrap();
                let next = group.add_thread(async { "ran" }).await;
                assert_eq!(next.wait().await, Ok("ran"));
            })
            .unwrap();
    }

    #[test]
    fn test_graceful_stop_waits_and_ignores_panics() {
        hub()
            .run(async {
                let group = ThreadGroup::new(3);
                group
                    .add_thread(async { hub::sleep(Duration::from_millis(5)).await })
                    .await;
                group
                    .add_thread(async {
                        hub::yield_now().await;
                        panic!("worker failed");
                    })
                    .await;
                group.stop(true).await;
                assert!(group.is_empty());
            })
            .unwrap();
    }
}
