//! Constrained ring-buffer leaves
//!
//! A fixed-capacity ring whose occupancy state lives in one 64-bit word:
//! `{head: u16, tail: u16, empty: bool}`. Every enqueue and dequeue commits
//! through a single CAS on that word; slot contents are written afterwards,
//! which is safe because the two-group lock keeps producers and consumers
//! out of each other's way while members of one side proceed concurrently.
//!
//! When the ring is full, an enqueue overwrites the oldest element: the
//! displaced workload transitions to `Canceled`, its continuations fire, and
//! a warning is recorded on the log sink. The prioritization policy decides
//! which side holds the higher-priority alpha group.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};
use crate::logsink::{EventKind, LogSink, TracingSink};
use crate::sync::{Group, GroupLock};
use crate::workload::Workload;

use super::{check_handle, ClassifyState, Handle, ParentLink, Qdisc, WorkScheduledNotifier};

/// Maximum ring capacity expressible in the packed state word
pub const MAX_RING_CAPACITY: usize = u16::MAX as usize;

/// Which side of a constrained ring holds the alpha (priority) group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrioritizationPolicy {
    /// Producers take priority; drops are preferred over enqueue stalls
    MinimizeSchedulingDelay,
    /// Consumers take priority; drops are minimized
    MinimizeWorkloadCancellation,
}

impl PrioritizationPolicy {
    fn producer_group(self) -> Group {
        match self {
            PrioritizationPolicy::MinimizeSchedulingDelay => Group::Alpha,
            PrioritizationPolicy::MinimizeWorkloadCancellation => Group::Beta,
        }
    }

    fn consumer_group(self) -> Group {
        self.producer_group().opposite()
    }
}

const EMPTY_BIT: u64 = 1 << 32;

fn pack(head: u16, tail: u16, empty: bool) -> u64 {
    u64::from(head) | (u64::from(tail) << 16) | if empty { EMPTY_BIT } else { 0 }
}

fn unpack(word: u64) -> (u16, u16, bool) {
    (
        (word & 0xFFFF) as u16,
        ((word >> 16) & 0xFFFF) as u16,
        word & EMPTY_BIT != 0,
    )
}

/// Shared core of the constrained FIFO and LIFO disciplines
struct RingCore {
    capacity: u16,
    state: AtomicU64,
    slots: Box<[Mutex<Option<Workload>>]>,
    lock: GroupLock,
    policy: PrioritizationPolicy,
    sink: Arc<dyn LogSink>,
}

enum Commit {
    Stored,
    Displaced(Workload),
}

impl RingCore {
    fn new(capacity: usize, policy: PrioritizationPolicy, sink: Arc<dyn LogSink>) -> SchedResult<Self> {
        if capacity == 0 || capacity > MAX_RING_CAPACITY {
            return Err(SchedError::InvalidCapacity(capacity));
        }
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        Ok(Self {
            capacity: capacity as u16,
            state: AtomicU64::new(pack(0, 0, true)),
            slots,
            lock: GroupLock::new(),
            policy,
            sink,
        })
    }

    fn advance(&self, index: u16) -> u16 {
        if index + 1 == self.capacity {
            0
        } else {
            index + 1
        }
    }

    fn retreat(&self, index: u16) -> u16 {
        if index == 0 {
            self.capacity - 1
        } else {
            index - 1
        }
    }

    fn count(&self) -> usize {
        let (head, tail, empty) = unpack(self.state.load(Ordering::Acquire));
        if empty {
            0
        } else if tail > head {
            usize::from(tail - head)
        } else {
            usize::from(self.capacity) - usize::from(head) + usize::from(tail)
        }
    }

    fn is_empty(&self) -> bool {
        unpack(self.state.load(Ordering::Acquire)).2
    }

    /// Commit an enqueue through one CAS on the state word
    fn push(&self, workload: Workload) -> SchedResult<Commit> {
        let _guard = self.lock.acquire(self.policy.producer_group())?;
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (head, tail, empty) = unpack(current);
            let full = !empty && head == tail;
            let next = if full {
                pack(self.advance(head), self.advance(tail), false)
            } else {
                pack(head, self.advance(tail), false)
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let displaced = self.slots[usize::from(tail)].lock().replace(workload);
                    debug_assert!(displaced.is_none() || full);
                    return Ok(match displaced {
                        Some(old) => Commit::Displaced(old),
                        None => Commit::Stored,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn pop_fifo(&self) -> Option<Workload> {
        let _guard = self.lock.acquire(self.policy.consumer_group()).ok()?;
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (head, tail, empty) = unpack(current);
            if empty {
                return None;
            }
            let new_head = self.advance(head);
            let next = pack(new_head, tail, new_head == tail);
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return self.slots[usize::from(head)].lock().take(),
                Err(actual) => current = actual,
            }
        }
    }

    fn pop_lifo(&self) -> Option<Workload> {
        let _guard = self.lock.acquire(self.policy.consumer_group()).ok()?;
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let (head, tail, empty) = unpack(current);
            if empty {
                return None;
            }
            let new_tail = self.retreat(tail);
            let next = pack(head, new_tail, head == new_tail);
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return self.slots[usize::from(new_tail)].lock().take(),
                Err(actual) => current = actual,
            }
        }
    }

    fn peek_fifo(&self) -> Option<Workload> {
        let (head, _, empty) = unpack(self.state.load(Ordering::Acquire));
        if empty {
            return None;
        }
        self.slots[usize::from(head)].lock().clone()
    }

    fn peek_lifo(&self) -> Option<Workload> {
        let (_, tail, empty) = unpack(self.state.load(Ordering::Acquire));
        if empty {
            return None;
        }
        self.slots[usize::from(self.retreat(tail))].lock().clone()
    }

    /// Cancel a displaced workload and record the capacity warning
    fn handle_displaced(&self, handle: Handle, displaced: Workload) {
        displaced.cancel_displaced();
        self.sink.record(
            EventKind::Warning,
            &format!(
                "qdisc {handle}: constrained ring at capacity {}; displaced the oldest workload",
                self.capacity
            ),
        );
    }
}

macro_rules! constrained_qdisc {
    ($(#[$doc:meta])* $name:ident, $pop:ident, $peek:ident) => {
        $(#[$doc])*
        pub struct $name {
            handle: Handle,
            ring: RingCore,
            parent: ParentLink,
            weak_self: Weak<$name>,
        }

        impl $name {
            /// Create a ring with `capacity` in `[1, 65535]`
            pub fn new(
                handle: Handle,
                capacity: usize,
                policy: PrioritizationPolicy,
            ) -> SchedResult<Arc<Self>> {
                Self::with_sink(handle, capacity, policy, Arc::new(TracingSink))
            }

            /// Create a ring recording warnings on the given sink
            pub fn with_sink(
                handle: Handle,
                capacity: usize,
                policy: PrioritizationPolicy,
                sink: Arc<dyn LogSink>,
            ) -> SchedResult<Arc<Self>> {
                check_handle(handle)?;
                let ring = RingCore::new(capacity, policy, sink)?;
                Ok(Arc::new_cyclic(|weak_self| Self {
                    handle,
                    ring,
                    parent: ParentLink::new(),
                    weak_self: weak_self.clone(),
                }))
            }

            fn as_dyn(&self) -> Arc<dyn Qdisc> {
                match self.weak_self.upgrade() {
                    Some(strong) => strong,
                    None => unreachable!("self-reference outlives the qdisc"),
                }
            }
        }

        impl Qdisc for $name {
            fn handle(&self) -> Handle {
                self.handle
            }

            fn is_empty(&self) -> bool {
                self.ring.is_empty()
            }

            fn best_effort_count(&self) -> usize {
                self.ring.count()
            }

            fn enqueue(
                &self,
                workload: Workload,
                _state: Option<&dyn ClassifyState>,
            ) -> SchedResult<()> {
                let guard = self.parent.pin(self.handle)?;
                workload.bind(&self.as_dyn())?;
                match self.ring.push(workload)? {
                    Commit::Stored => {}
                    Commit::Displaced(old) => self.ring.handle_displaced(self.handle, old),
                }
                guard.notify();
                Ok(())
            }

            fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<Workload> {
                self.ring.$pop()
            }

            fn try_peek(&self, _worker_id: usize) -> Option<Workload> {
                self.ring.$peek()
            }

            fn try_remove(&self, _workload: &Workload) -> bool {
                false
            }

            fn on_worker_terminated(&self, _worker_id: usize) {}

            fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()> {
                self.parent.initialize(self.handle, parent)
            }

            fn complete(&self) {
                self.parent.complete();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("handle", &self.handle)
                    .field("capacity", &self.ring.capacity)
                    .field("len", &self.ring.count())
                    .finish()
            }
        }
    };
}

constrained_qdisc!(
    /// Bounded FIFO over the packed-word ring
    ConstrainedFifo,
    pop_fifo,
    peek_fifo
);

constrained_qdisc!(
    /// Bounded LIFO over the packed-word ring; pops at `(tail − 1) mod capacity`
    ConstrainedLifo,
    pop_lifo,
    peek_lifo
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::test_support::CapturingSink;
    use crate::qdisc::test_util::{must, unit_workload as workload, NullNotifier};
    use crate::workload::WorkloadStatus;

    fn fifo(capacity: usize) -> (Arc<ConstrainedFifo>, CapturingSink) {
        let sink = CapturingSink::default();
        let ring = must(ConstrainedFifo::with_sink(
            7,
            capacity,
            PrioritizationPolicy::MinimizeSchedulingDelay,
            Arc::new(sink.clone()),
        ));
        ring.initialize(Arc::new(NullNotifier)).ok();
        (ring, sink)
    }

    #[test]
    fn test_capacity_bounds() {
        assert_eq!(
            ConstrainedFifo::new(7, 0, PrioritizationPolicy::MinimizeSchedulingDelay).err(),
            Some(SchedError::InvalidCapacity(0))
        );
        assert_eq!(
            ConstrainedFifo::new(7, 65536, PrioritizationPolicy::MinimizeSchedulingDelay).err(),
            Some(SchedError::InvalidCapacity(65536))
        );
        assert!(
            ConstrainedFifo::new(7, 65535, PrioritizationPolicy::MinimizeSchedulingDelay).is_ok()
        );
    }

    #[test]
    fn test_fifo_insertion_order() {
        let (ring, _) = fifo(3);
        let workloads: Vec<_> = (0..3).map(|_| workload()).collect();
        for w in &workloads {
            ring.enqueue(w.clone(), None).ok();
        }
        for expected in &workloads {
            let got = ring.try_dequeue(0, false);
            assert!(got.is_some_and(|w| w.same_as(expected)));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_displaces_oldest_once() {
        let (ring, sink) = fifo(3);
        let workloads: Vec<_> = (0..4).map(|_| workload()).collect();
        for w in &workloads {
            ring.enqueue(w.clone(), None).ok();
        }

        // The oldest was displaced and canceled, exactly once.
        assert_eq!(workloads[0].status(), WorkloadStatus::Canceled);
        assert_eq!(sink.count(EventKind::Warning), 1);
        assert_eq!(ring.best_effort_count(), 3);

        for expected in &workloads[1..] {
            let got = ring.try_dequeue(0, false);
            assert!(got.is_some_and(|w| w.same_as(expected)));
        }
    }

    #[test]
    fn test_lifo_pops_newest_first() {
        let ring = must(ConstrainedLifo::new(
            8,
            3,
            PrioritizationPolicy::MinimizeWorkloadCancellation,
        ));
        ring.initialize(Arc::new(NullNotifier)).ok();

        let workloads: Vec<_> = (0..3).map(|_| workload()).collect();
        for w in &workloads {
            ring.enqueue(w.clone(), None).ok();
        }

        for expected in workloads.iter().rev() {
            let got = ring.try_dequeue(0, false);
            assert!(got.is_some_and(|w| w.same_as(expected)));
        }
    }

    #[test]
    fn test_capacity_one_keeps_newest() {
        let (ring, sink) = fifo(1);
        let first = workload();
        let second = workload();
        ring.enqueue(first.clone(), None).ok();
        ring.enqueue(second.clone(), None).ok();

        assert_eq!(first.status(), WorkloadStatus::Canceled);
        assert_eq!(sink.count(EventKind::Warning), 1);
        let got = ring.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&second)));
    }

    #[test]
    fn test_peek_sees_head() {
        let (ring, _) = fifo(3);
        let first = workload();
        ring.enqueue(first.clone(), None).ok();
        ring.enqueue(workload(), None).ok();

        let peeked = ring.try_peek(0);
        assert!(peeked.is_some_and(|w| w.same_as(&first)));
        assert_eq!(ring.best_effort_count(), 2);
    }
}
