//! Deadline timer service.
//!
//! A deadline min-heap driven by the platform tick. Consumers arm an event
//! against an absolute tick deadline and get back a [`TimerHandle`];
//! disarming is idempotent and lazy — cancelled entries are skipped when
//! their deadline comes up rather than removed from the heap.
//!
//! The tick path calls [`DeadlineTimer::expire`] and dispatches whatever
//! events are due. Expiry never runs callbacks under the timer lock.

use alloc::collections::{BTreeSet, BinaryHeap};
use alloc::vec::Vec;
use core::cmp::{Ordering, Reverse};

use muon_core::sync::SpinLock;

/// Handle identifying one armed timer. Never reused within a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TimerHandle(u64);

struct TimerEntry<E> {
    deadline: u64,
    handle: TimerHandle,
    event: E,
}

impl<E> PartialEq for TimerEntry<E> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl<E> Eq for TimerEntry<E> {}

impl<E> PartialOrd for TimerEntry<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for TimerEntry<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Handle breaks deadline ties so expiry order is deterministic.
        self.deadline
            .cmp(&other.deadline)
            .then(self.handle.cmp(&other.handle))
    }
}

struct TimerState<E> {
    heap: BinaryHeap<Reverse<TimerEntry<E>>>,
    /// Handles still armed. Disarm removes from here; expiry of a handle
    /// absent from this set is skipped.
    armed: BTreeSet<TimerHandle>,
    next_handle: u64,
}

/// Tick-driven timer service carrying events of type `E`.
pub struct DeadlineTimer<E> {
    state: SpinLock<TimerState<E>>,
}

impl<E> DeadlineTimer<E> {
    /// Creates an empty timer service.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(TimerState {
                heap: BinaryHeap::new(),
                armed: BTreeSet::new(),
                next_handle: 1,
            }),
        }
    }

    /// Arms `event` to fire once `deadline` (absolute ticks) is reached.
    pub fn arm(&self, deadline: u64, event: E) -> TimerHandle {
        let mut state = self.state.lock();
        let handle = TimerHandle(state.next_handle);
        state.next_handle += 1;
        state.armed.insert(handle);
        state.heap.push(Reverse(TimerEntry {
            deadline,
            handle,
            event,
        }));
        handle
    }

    /// Disarms a timer. Idempotent: disarming an already-fired or
    /// already-disarmed handle is a no-op.
    ///
    /// Returns `true` if the timer was still armed.
    pub fn disarm(&self, handle: TimerHandle) -> bool {
        self.state.lock().armed.remove(&handle)
    }

    /// Pops every armed event whose deadline is at or before `now`.
    ///
    /// Disarmed entries are dropped silently. The caller dispatches the
    /// returned events outside the timer lock.
    pub fn expire(&self, now: u64) -> Vec<E> {
        let mut due = Vec::new();
        let mut state = self.state.lock();
        while let Some(Reverse(entry)) = state.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = state.heap.pop() else {
                break;
            };
            if state.armed.remove(&entry.handle) {
                due.push(entry.event);
            }
        }
        due
    }
}

impl<E> Default for DeadlineTimer<E> {
    fn default() -> Self {
        Self::new()
    }
}
