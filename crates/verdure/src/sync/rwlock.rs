//! Reader-writer lock for tasks
//!
//! Many readers or one writer. The writer may nest write locks and may read
//! while writing. Blocked requests queue in arrival order and the queue is
//! never bypassed: once a writer is waiting, new readers line up behind it.

use super::{LockError, LockId, WaitSlot};
use crate::hub::{self, TaskId};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// What the calling task holds, as reported by [`ReaderWriterLock::owner`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Owner {
    /// Shared access
    Reader,
    /// Exclusive access
    Writer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Kind {
    Read,
    Write,
}

struct RwWaiter {
    task: TaskId,
    kind: Kind,
    slot: Arc<WaitSlot>,
}

#[derive(Default)]
struct State {
    /// Read lock count per reading task
    readers: FxHashMap<TaskId, usize>,
    /// One entry per live write guard or writer-held read guard, all the
    /// same task
    writers: Vec<TaskId>,
    /// Writers queued in `waiters`
    pending_writers: FxHashSet<TaskId>,
    waiters: VecDeque<RwWaiter>,
}

impl State {
    fn current_writer(&self) -> Option<TaskId> {
        self.writers.last().copied()
    }

    fn add_reader(&mut self, task: TaskId) {
        *self.readers.entry(task).or_insert(0) += 1;
    }

    fn remove_reader(&mut self, task: TaskId) {
        if let Some(count) = self.readers.get_mut(&task) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(&task);
            }
        }
    }

    /// Admit from the head of the queue while that is legal.
    fn notify(&mut self, lock: LockId) -> Vec<Arc<WaitSlot>> {
        let mut admitted = Vec::new();
        while let Some(head) = self.waiters.front() {
            match head.kind {
                Kind::Read if self.writers.is_empty() => {
                    let Some(waiter) = self.waiters.pop_front() else { break };
                    self.add_reader(waiter.task);
                    tracing::debug!(%lock, task = %waiter.task, "admitted queued reader");
                    waiter.slot.grant();
                    admitted.push(waiter.slot);
                }
                Kind::Write if self.writers.is_empty() && self.readers.is_empty() => {
                    let Some(waiter) = self.waiters.pop_front() else { break };
                    self.pending_writers.remove(&waiter.task);
                    self.writers.push(waiter.task);
                    tracing::debug!(%lock, task = %waiter.task, "admitted queued writer");
                    waiter.slot.grant();
                    admitted.push(waiter.slot);
                    break;
                }
                _ => break,
            }
        }
        admitted
    }
}

fn wake_all(slots: Vec<Arc<WaitSlot>>) {
    for slot in slots {
        slot.wake_soon();
    }
}

/// Lock allowing concurrent readers or a single (reentrant) writer
pub struct ReaderWriterLock {
    id: LockId,
    state: Mutex<State>,
}

impl ReaderWriterLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self {
            id: LockId::next(),
            state: Mutex::new(State::default()),
        }
    }

    /// Lock identity
    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire shared access for the calling task.
    ///
    /// Fails with [`LockError::PendingWriter`] if the caller is itself queued
    /// as a writer. The current writer gets a guard right away, and the lock
    /// stays exclusive until that guard drops, even if the write guards go
    /// first.
    pub async fn read_lock(&self) -> Result<ReadGuard<'_>, LockError> {
        let task = self.calling_task()?;
        let slot = {
            let mut state = self.state.lock();
            if state.pending_writers.contains(&task) {
                return Err(LockError::PendingWriter(self.id));
            }
            if state.current_writer() == Some(task) {
                state.writers.push(task);
                return Ok(ReadGuard {
                    lock: self,
                    task,
                    nested_in_write: true,
                });
            }
            if state.readers.contains_key(&task)
                || (state.writers.is_empty() && state.pending_writers.is_empty())
            {
                state.add_reader(task);
                return Ok(ReadGuard {
                    lock: self,
                    task,
                    nested_in_write: false,
                });
            }
            self.enqueue(&mut state, task, Kind::Read)
        };
        Admit::new(self, task, Kind::Read, slot).await;
        Ok(ReadGuard {
            lock: self,
            task,
            nested_in_write: false,
        })
    }

    /// Acquire exclusive access for the calling task.
    ///
    /// Fails with [`LockError::Escalation`] without blocking if the caller
    /// holds a read lock. Nests if the caller already writes.
    pub async fn write_lock(&self) -> Result<WriteGuard<'_>, LockError> {
        let task = self.calling_task()?;
        let slot = {
            let mut state = self.state.lock();
            if state.current_writer() == Some(task) {
                state.writers.push(task);
                return Ok(WriteGuard { lock: self, task });
            }
            if state.readers.contains_key(&task) {
                return Err(LockError::Escalation(self.id));
            }
            if state.readers.is_empty() && state.writers.is_empty() && state.waiters.is_empty() {
                state.writers.push(task);
                return Ok(WriteGuard { lock: self, task });
            }
            state.pending_writers.insert(task);
            self.enqueue(&mut state, task, Kind::Write)
        };
        Admit::new(self, task, Kind::Write, slot).await;
        Ok(WriteGuard { lock: self, task })
    }

    /// What the calling task holds on this lock
    pub fn owner(&self) -> Option<Owner> {
        let task = hub::current_task_id()?;
        let state = self.state.lock();
        if state.current_writer() == Some(task) {
            Some(Owner::Writer)
        } else if state.readers.contains_key(&task) {
            Some(Owner::Reader)
        } else {
            None
        }
    }

    /// Whether the calling task is the writer, or with `check_pending` also
    /// whether it is queued as one
    pub fn is_writer(&self, check_pending: bool) -> bool {
        let Some(task) = hub::current_task_id() else {
            return false;
        };
        let state = self.state.lock();
        state.current_writer() == Some(task)
            || (check_pending && state.pending_writers.contains(&task))
    }

    /// Whether the calling task holds a read lock
    pub fn is_reader(&self) -> bool {
        let Some(task) = hub::current_task_id() else {
            return false;
        };
        self.state.lock().readers.contains_key(&task)
    }

    /// Whether any writer is queued
    pub fn has_pending_writers(&self) -> bool {
        !self.state.lock().pending_writers.is_empty()
    }

    /// Number of distinct reading tasks
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    fn calling_task(&self) -> Result<TaskId, LockError> {
        hub::current_task_id().ok_or(LockError::OutsideTask(self.id))
    }

    fn enqueue(&self, state: &mut State, task: TaskId, kind: Kind) -> Arc<WaitSlot> {
        tracing::trace!(lock = %self.id, %task, ?kind, "queueing on rwlock");
        let slot = WaitSlot::new();
        state.waiters.push_back(RwWaiter {
            task,
            kind,
            slot: slot.clone(),
        });
        slot
    }

    fn release_read(&self, task: TaskId) {
        let admitted = {
            let mut state = self.state.lock();
            state.remove_reader(task);
            state.notify(self.id)
        };
        wake_all(admitted);
    }

    fn release_write(&self) {
        let admitted = {
            let mut state = self.state.lock();
            state.writers.pop();
            state.notify(self.id)
        };
        wake_all(admitted);
    }
}

impl Default for ReaderWriterLock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReaderWriterLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReaderWriterLock")
            .field("id", &self.id)
            .field("readers", &state.readers.len())
            .field("writer", &state.current_writer())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Suspends until `notify` grants the queued request
struct Admit<'a> {
    lock: &'a ReaderWriterLock,
    task: TaskId,
    kind: Kind,
    slot: Arc<WaitSlot>,
    done: bool,
}

impl<'a> Admit<'a> {
    fn new(lock: &'a ReaderWriterLock, task: TaskId, kind: Kind, slot: Arc<WaitSlot>) -> Self {
        Self {
            lock,
            task,
            kind,
            slot,
            done: false,
        }
    }
}

impl Future for Admit<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.slot.register(cx.waker());
        if self.slot.is_granted() {
            self.done = true;
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl Drop for Admit<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let admitted = {
            let mut state = self.lock.state.lock();
            if self.slot.is_granted() {
                // Admitted but never resumed: give it back.
                match self.kind {
                    Kind::Read => state.remove_reader(self.task),
                    Kind::Write => {
                        state.writers.pop();
                    }
                }
            } else {
                state.waiters.retain(|w| !Arc::ptr_eq(&w.slot, &self.slot));
                if self.kind == Kind::Write {
                    state.pending_writers.remove(&self.task);
                }
            }
            state.notify(self.lock.id)
        };
        wake_all(admitted);
    }
}

/// Shared access to a [`ReaderWriterLock`]; released on drop
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadGuard<'a> {
    lock: &'a ReaderWriterLock,
    task: TaskId,
    /// Read taken by the writer, held as a writer entry
    nested_in_write: bool,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.nested_in_write {
            self.lock.release_write();
        } else {
            self.lock.release_read(self.task);
        }
    }
}

impl fmt::Debug for ReadGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("lock", &self.lock.id)
            .field("task", &self.task)
            .finish()
    }
}

/// Exclusive access to a [`ReaderWriterLock`]; released on drop
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteGuard<'a> {
    lock: &'a ReaderWriterLock,
    task: TaskId,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

impl fmt::Debug for WriteGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("lock", &self.lock.id)
            .field("task", &self.task)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::hub::Hub;
    use std::time::Duration;

    fn hub() -> Hub {
        Hub::new(HubConfig::virtual_clock())
    }

    #[test]
    fn test_outside_task_is_rejected() {
        let lock = ReaderWriterLock::new();
        let mut cx = Context::from_waker(std::task::Waker::noop());
        let read = std::pin::pin!(lock.read_lock());
        match read.poll(&mut cx) {
            Poll::Ready(Err(err)) => assert_eq!(err, LockError::OutsideTask(lock.id())),
            _ => panic!("expected OutsideTask"),
        }
        assert_eq!(lock.owner(), None);
        assert!(!lock.is_reader());
    }

    #[test]
    fn test_concurrent_readers() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let _mine = lock.read_lock().await.unwrap();
                let other = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.read_lock().await.unwrap();
                        lock.reader_count()
                    })
                };
                assert_eq!(other.wait().await, Ok(2));
                assert_eq!(lock.owner(), Some(Owner::Reader));
            })
            .unwrap();
    }

    #[test]
    fn test_escalation_fails_without_blocking() {
        hub()
            .run(async {
                let lock = ReaderWriterLock::new();
                let _read = lock.read_lock().await.unwrap();
                let err = lock.write_lock().await.unwrap_err();
                assert_eq!(err, LockError::Escalation(lock.id()));
                assert!(!lock.has_pending_writers());
            })
            .unwrap();
    }

    #[test]
    fn test_writer_nests_and_reads() {
        hub()
            .run(async {
                let lock = ReaderWriterLock::new();
                let outer = lock.write_lock().await.unwrap();
                let inner = lock.write_lock().await.unwrap();
                {
                    let _read = lock.read_lock().await.unwrap();
                    assert_eq!(lock.reader_count(), 0);
                    assert_eq!(lock.owner(), Some(Owner::Writer));
                }
                drop(inner);
                assert!(lock.is_writer(false));
                drop(outer);
                assert!(!lock.is_writer(false));
                assert_eq!(lock.owner(), None);
            })
            .unwrap();
    }

    #[test]
    fn test_writer_read_outlives_write_guard() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let write = lock.write_lock().await.unwrap();
                let read = lock.read_lock().await.unwrap();
                drop(write);
                assert_eq!(lock.owner(), Some(Owner::Writer));

                let other = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.write_lock().await.unwrap();
                    })
                };
                hub::sleep(Duration::from_millis(5)).await;
                assert!(!other.is_finished());
                assert!(lock.has_pending_writers());

                drop(read);
                assert_eq!(lock.owner(), None);
                other.wait().await.unwrap();
                assert!(!lock.has_pending_writers());
            })
            .unwrap();
    }

    #[test]
    fn test_writer_excludes_readers() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let log = Arc::new(Mutex::new(Vec::new()));
                let write = lock.write_lock().await.unwrap();
                let reader = {
                    let (lock, log) = (lock.clone(), log.clone());
                    hub::spawn(async move {
                        let _guard = lock.read_lock().await.unwrap();
                        log.lock().push("read");
                    })
                };
                hub::sleep(Duration::from_millis(5)).await;
                log.lock().push("write done");
                drop(write);
                reader.wait().await.unwrap();
                assert_eq!(*log.lock(), vec!["write done", "read"]);
            })
            .unwrap();
    }

    #[test]
    fn test_pending_writer_cannot_read() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let holder = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.read_lock().await.unwrap();
                        hub::sleep(Duration::from_millis(10)).await;
                    })
                };
                hub::yield_now().await;

                let mut write = std::pin::pin!(lock.write_lock());
                std::future::poll_fn(|cx| {
                    assert!(write.as_mut().poll(cx).is_pending());
                    Poll::Ready(())
                })
                .await;
                assert!(lock.is_writer(true));
                assert!(!lock.is_writer(false));

                let err = lock.read_lock().await.unwrap_err();
                assert_eq!(err, LockError::PendingWriter(lock.id()));

                holder.wait().await.unwrap();
                let _guard = write.await.unwrap();
                assert_eq!(lock.owner(), Some(Owner::Writer));
                assert!(!lock.has_pending_writers());
            })
            .unwrap();
    }

    #[test]
    fn test_killed_pending_writer_unblocks_readers() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let _read = lock.read_lock().await.unwrap();
                let writer = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.write_lock().await.unwrap();
                    })
                };
                hub::yield_now().await;
                let reader = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.read_lock().await.unwrap();
                    })
                };
                hub::yield_now().await;
                assert!(!reader.is_finished());

                writer.kill().unwrap();
                assert!(!lock.has_pending_writers());
                reader.wait().await.unwrap();
            })
            .unwrap();
    }

    #[test]
    fn test_reader_holder_killed_releases() {
        hub()
            .run(async {
                let lock = Arc::new(ReaderWriterLock::new());
                let holder = {
                    let lock = lock.clone();
                    hub::spawn(async move {
                        let _guard = lock.read_lock().await.unwrap();
                        hub::sleep(Duration::from_secs(60)).await;
                    })
                };
                hub::yield_now().await;
                assert_eq!(lock.reader_count(), 1);
                holder.kill().unwrap();
                assert_eq!(lock.reader_count(), 0);
                let _write = lock.write_lock().await.unwrap();
            })
            .unwrap();
    }
}
