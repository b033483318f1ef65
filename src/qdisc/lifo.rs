//! Unbounded LIFO leaf
//!
//! Multi-producer/multi-consumer stack behind a short-critical-section
//! mutex. The dequeue contracts match FIFO: removal is unsupported and
//! back-track is a no-op because there is no cursor to rewind.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::SchedResult;
use crate::workload::Workload;

use super::{check_handle, ClassifyState, Handle, ParentLink, Qdisc, WorkScheduledNotifier};

/// Unbounded LIFO queuing discipline
pub struct Lifo {
    handle: Handle,
    storage: Mutex<Vec<Workload>>,
    parent: ParentLink,
    weak_self: Weak<Lifo>,
}

impl Lifo {
    /// Create a LIFO leaf with the given handle
    pub fn new(handle: Handle) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            storage: Mutex::new(Vec::new()),
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

impl Qdisc for Lifo {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    fn best_effort_count(&self) -> usize {
        self.storage.lock().len()
    }

    fn enqueue(&self, workload: Workload, _state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        let guard = self.parent.pin(self.handle)?;
        workload.bind(&self.as_dyn())?;
        self.storage.lock().push(workload);
        guard.notify();
        Ok(())
    }

    fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<Workload> {
        self.storage.lock().pop()
    }

    fn try_peek(&self, _worker_id: usize) -> Option<Workload> {
        self.storage.lock().last().cloned()
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

impl std::fmt::Debug for Lifo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifo")
            .field("handle", &self.handle)
            .field("len", &self.storage.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdisc::test_util::{must, unit_workload as workload, NullNotifier};

    #[test]
    fn test_lifo_order() {
        let lifo = must(Lifo::new(2));
        lifo.initialize(Arc::new(NullNotifier)).ok();

        let workloads: Vec<_> = (0..3).map(|_| workload()).collect();
        for w in &workloads {
            lifo.enqueue(w.clone(), None).ok();
        }

        for expected in workloads.iter().rev() {
            let got = lifo.try_dequeue(0, false);
            assert!(got.is_some_and(|w| w.same_as(expected)));
        }
        assert!(lifo.is_empty());
    }

    #[test]
    fn test_peek_matches_next_dequeue() {
        let lifo = must(Lifo::new(2));
        lifo.initialize(Arc::new(NullNotifier)).ok();

        let first = workload();
        let second = workload();
        lifo.enqueue(first, None).ok();
        lifo.enqueue(second.clone(), None).ok();

        let peeked = lifo.try_peek(0);
        assert!(peeked.is_some_and(|w| w.same_as(&second)));
        let got = lifo.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&second)));
    }

    #[test]
    fn test_remove_unsupported() {
        let lifo = must(Lifo::new(2));
        lifo.initialize(Arc::new(NullNotifier)).ok();
        let w = workload();
        lifo.enqueue(w.clone(), None).ok();
        assert!(!lifo.try_remove(&w));
        assert_eq!(lifo.best_effort_count(), 1);
    }
}
