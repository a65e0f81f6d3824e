//! Timer heap for delayed callbacks
//!
//! Entries are ordered by `(deadline, seq)`. The sequence number is a
//! per-hub counter, so two callbacks whose deadlines the clock cannot tell
//! apart still fire in registration order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const CANCELLED: u8 = 2;

/// Below this many cancelled entries the heap is never rebuilt
const COMPACT_MIN: usize = 16;

type Callback = Box<dyn FnOnce() + Send>;

/// Entry in the timer heap
pub(crate) struct TimerEntry {
    /// Hub-relative time at which to fire
    deadline: Duration,
    /// Registration order, breaks deadline ties
    seq: u64,
    state: Arc<AtomicU8>,
    callback: Callback,
}

impl TimerEntry {
    /// Claim the entry for firing. Fails if it was cancelled meanwhile.
    pub(crate) fn claim(&self) -> bool {
        self.state
            .compare_exchange(PENDING, FIRED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok()
    }

    pub(crate) fn into_callback(self) -> Callback {
        self.callback
    }

    fn is_cancelled(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) == CANCELLED
    }
}

// Reverse ordering for min-heap (earliest deadline, then lowest seq, first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Cancelable handle to a scheduled callback
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<AtomicU8>,
    /// Cancellation counter of the owning queue
    cancelled: Arc<AtomicUsize>,
}

impl TimerHandle {
    /// Cancel the callback. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(PENDING, CANCELLED, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
            .is_ok();
        if cancelled {
            self.cancelled.fetch_add(1, AtomicOrdering::AcqRel);
        }
        cancelled
    }

    /// Whether the callback is still waiting to fire
    pub fn is_pending(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) == PENDING
    }

    /// Whether the callback has run
    pub fn has_fired(&self) -> bool {
        self.state.load(AtomicOrdering::Acquire) == FIRED
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(AtomicOrdering::Acquire) {
            PENDING => "pending",
            FIRED => "fired",
            _ => "cancelled",
        };
        f.debug_struct("TimerHandle").field("state", &state).finish()
    }
}

/// Min-heap of pending callbacks.
///
/// Cancelled entries are dropped lazily when they reach the top, and the
/// whole heap is rebuilt once they make up more than half of it.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_seq: u64,
    /// Cancelled entries still in `heap`
    cancelled: Arc<AtomicUsize>,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, deadline: Duration, callback: Callback) -> TimerHandle {
        self.maybe_compact();
        let state = Arc::new(AtomicU8::new(PENDING));
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq,
            state: state.clone(),
            callback,
        });
        TimerHandle {
            state,
            cancelled: self.cancelled.clone(),
        }
    }

    /// Sequence number the next registration will get
    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Pop the earliest live entry that is due at `now` and was registered
    /// before `seq_limit`. Cancelled entries on top are discarded.
    pub(crate) fn pop_due(&mut self, now: Duration, seq_limit: u64) -> Option<TimerEntry> {
        self.purge_cancelled();
        let top = self.heap.peek()?;
        if top.deadline <= now && top.seq < seq_limit {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Deadline of the earliest live entry
    pub(crate) fn next_deadline(&mut self) -> Option<Duration> {
        self.purge_cancelled();
        self.heap.peek().map(|entry| entry.deadline)
    }

    /// Number of entries still in the heap, including cancelled ones not
    /// yet purged
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) -> Vec<TimerEntry> {
        self.cancelled.store(0, AtomicOrdering::Release);
        self.heap.drain().collect()
    }

    fn purge_cancelled(&mut self) {
        while self.heap.peek().is_some_and(TimerEntry::is_cancelled) {
            self.heap.pop();
            let _ = self.cancelled.fetch_update(
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
                |n| n.checked_sub(1),
            );
        }
    }

    fn maybe_compact(&mut self) {
        let cancelled = self.cancelled.load(AtomicOrdering::Acquire);
        if cancelled < COMPACT_MIN || cancelled * 2 <= self.heap.len() {
            return;
        }
        let before = self.heap.len();
        self.heap.retain(|entry| !entry.is_cancelled());
        self.cancelled.store(0, AtomicOrdering::Release);
        tracing::trace!(before, after = self.heap.len(), "compacted timer heap");
    }
}
