//! Unbounded FIFO leaf
//!
//! Multi-producer/multi-consumer queue on a lock-free segment queue. A small
//! staging slot in front of the queue supports `try_peek`: peeking pops the
//! head into the slot, and dequeues drain the slot before the queue so FIFO
//! order is preserved.

use std::sync::{Arc, Weak};

use crossbeam::queue::SegQueue;
use parking_lot::Mutex;

use crate::error::SchedResult;
use crate::workload::Workload;

use super::{check_handle, ClassifyState, Handle, ParentLink, Qdisc, WorkScheduledNotifier};

/// Lock-free queue with a peekable staging slot
pub(crate) struct StagedQueue {
    queue: SegQueue<Workload>,
    staged: Mutex<Option<Workload>>,
}

impl StagedQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            staged: Mutex::new(None),
        }
    }

    pub(crate) fn push(&self, workload: Workload) {
        self.queue.push(workload);
    }

    pub(crate) fn pop(&self) -> Option<Workload> {
        if let Some(staged) = self.staged.lock().take() {
            return Some(staged);
        }
        self.queue.pop()
    }

    /// Observe the head; stages it so order is kept
    pub(crate) fn peek(&self) -> Option<Workload> {
        let mut staged = self.staged.lock();
        if staged.is_none() {
            *staged = self.queue.pop();
        }
        staged.clone()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.staged.lock().is_none() && self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        let staged = usize::from(self.staged.lock().is_some());
        staged + self.queue.len()
    }
}

/// Unbounded FIFO queuing discipline
pub struct Fifo {
    handle: Handle,
    storage: StagedQueue,
    parent: ParentLink,
    weak_self: Weak<Fifo>,
}

impl Fifo {
    /// Create a FIFO leaf with the given handle
    pub fn new(handle: Handle) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            storage: StagedQueue::new(),
            parent: ParentLink::new(),
            weak_self: weak_self.clone(),
        }))
    }

    fn as_dyn(&self) -> Arc<dyn Qdisc> {
        // The weak self-reference always upgrades while `self` is alive.
        match self.weak_self.upgrade() {
            Some(strong) => strong,
            None => unreachable!("self-reference outlives the qdisc"),
        }
    }
}

impl Qdisc for Fifo {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    fn best_effort_count(&self) -> usize {
        self.storage.len()
    }

    fn enqueue(&self, workload: Workload, _state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        let guard = self.parent.pin(self.handle)?;
        workload.bind(&self.as_dyn())?;
        self.storage.push(workload);
        guard.notify();
        Ok(())
    }

    fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<Workload> {
        // No cursor to rewind; back-track is a no-op for FIFO.
        self.storage.pop()
    }

    fn try_peek(&self, _worker_id: usize) -> Option<Workload> {
        self.storage.peek()
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

impl std::fmt::Debug for Fifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fifo")
            .field("handle", &self.handle)
            .field("len", &self.storage.len())
            .finish()
    }
}
