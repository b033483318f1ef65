//! Measurement wrapper
//!
//! A classful qdisc with exactly one child. It is transparent to the child's
//! discipline; its only effect is attaching a measurement probe to every
//! dequeued workload, recording `(end − start)` ticks into a virtual-time
//! table keyed by payload identity.

use std::sync::{Arc, Weak};

use crate::error::{SchedError, SchedResult};
use crate::vtime::{MeasurementProbe, TickSource, VirtualTimeTable};
use crate::workload::{Continuation, Workload};

use super::{
    check_handle, check_no_duplicate_handles, BubbleNotifier, ClassfulQdisc, ClassifyState,
    Handle, HasParentLink, ParentLink, Qdisc, RoutingPath, RoutingPathNode,
    WorkScheduledNotifier,
};

/// Transparent single-child measurement qdisc
pub struct MeasuredQdisc {
    handle: Handle,
    child: Arc<dyn Qdisc>,
    table: Arc<VirtualTimeTable>,
    parent: ParentLink,
    weak_self: Weak<MeasuredQdisc>,
}

impl MeasuredQdisc {
    /// Wrap `child`, recording into a fresh table with the given tick source
    pub fn new(handle: Handle, child: Arc<dyn Qdisc>, source: TickSource) -> SchedResult<Arc<Self>> {
        Self::with_table(
            handle,
            child,
            Arc::new(VirtualTimeTable::new(source, -1, 32)),
        )
    }

    /// Wrap `child`, recording into a shared table
    pub fn with_table(
        handle: Handle,
        child: Arc<dyn Qdisc>,
        table: Arc<VirtualTimeTable>,
    ) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        check_no_duplicate_handles(&[handle], &child)?;
        let wrapper = Arc::new_cyclic(|weak_self: &Weak<MeasuredQdisc>| Self {
            handle,
            child: child.clone(),
            table,
            parent: ParentLink::new(),
            weak_self: weak_self.clone(),
        });
        child.initialize(Arc::new(BubbleNotifier(wrapper.weak_self.clone())))?;
        Ok(wrapper)
    }

    /// The table this wrapper records into
    pub fn table(&self) -> &Arc<VirtualTimeTable> {
        &self.table
    }
}

impl HasParentLink for MeasuredQdisc {
    fn parent_link(&self) -> &ParentLink {
        &self.parent
    }

    fn link_handle(&self) -> Handle {
        self.handle
    }
}

impl Qdisc for MeasuredQdisc {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.child.is_empty()
    }

    fn best_effort_count(&self) -> usize {
        self.child.best_effort_count()
    }

    fn enqueue(&self, workload: Workload, state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        let _guard = self.parent.pin(self.handle)?;
        self.child.enqueue(workload, state)
    }

    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<Workload> {
        let workload = self.child.try_dequeue(worker_id, backtrack)?;
        workload.attach_continuation_first(Continuation::Measure(MeasurementProbe::rent(
            self.table.clone(),
        )));
        Some(workload)
    }

    fn try_peek(&self, worker_id: usize) -> Option<Workload> {
        self.child.try_peek(worker_id)
    }

    fn try_remove(&self, workload: &Workload) -> bool {
        self.child.try_remove(workload)
    }

    fn on_worker_terminated(&self, worker_id: usize) {
        self.child.on_worker_terminated(worker_id);
    }

    fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()> {
        self.parent.initialize(self.handle, parent)
    }

    fn complete(&self) {
        self.parent.complete();
        self.child.complete();
    }

    fn for_each_handle(&self, visit: &mut dyn FnMut(Handle)) {
        visit(self.handle);
        self.child.for_each_handle(visit);
    }
}

impl ClassfulQdisc for MeasuredQdisc {
    fn try_add_child(&self, child: Arc<dyn Qdisc>) -> SchedResult<()> {
        Err(SchedError::InvariantViolation(
            self.handle,
            format!(
                "measurement wrapper holds exactly one child (rejected {})",
                child.handle()
            ),
        ))
    }

    fn try_remove_child(&self, _handle: Handle) -> bool {
        false
    }

    fn try_find_child(&self, handle: Handle) -> Option<Arc<dyn Qdisc>> {
        (self.child.handle() == handle).then(|| self.child.clone())
    }

    fn try_find_route(&self, handle: Handle, path: &mut RoutingPath) -> bool {
        if self.child.handle() != handle {
            return false;
        }
        let via = match self.weak_self.upgrade() {
            Some(strong) => strong as Arc<dyn ClassfulQdisc>,
            None => return false,
        };
        path.push(RoutingPathNode {
            qdisc: via,
            handle: self.handle,
            child_offset: 0,
        });
        path.set_target(self.child.clone());
        true
    }
}

impl std::fmt::Debug for MeasuredQdisc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasuredQdisc")
            .field("handle", &self.handle)
            .field("child", &self.child.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdisc::fifo::Fifo;
    use crate::qdisc::test_util::{must, unit_workload as workload, NullNotifier};
    use crate::workload::DequeueDecision;

    #[test]
    fn test_transparent_to_child_order() {
        let child = must(Fifo::new(2));
        let wrapper = must(MeasuredQdisc::new(1, child, TickSource::Precise));
        wrapper.initialize(Arc::new(NullNotifier)).ok();

        let first = workload();
        let second = workload();
        wrapper.enqueue(first.clone(), None).ok();
        wrapper.enqueue(second.clone(), None).ok();

        let got = wrapper.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&first)));
    }

    #[test]
    fn test_records_execution_time() {
        let child = must(Fifo::new(2));
        let wrapper = must(MeasuredQdisc::new(1, child, TickSource::Precise));
        wrapper.initialize(Arc::new(NullNotifier)).ok();

        let w = workload();
        let payload = w.payload_id();
        wrapper.enqueue(w, None).ok();

        let Some(got) = wrapper.try_dequeue(0, false) else {
            panic!("workload was enqueued")
        };
        assert_eq!(got.begin_dequeue(), DequeueDecision::Run);
        got.execute();

        assert!(wrapper.table().timing(payload).is_some_and(|t| t.samples == 1));
    }

    #[test]
    fn test_second_child_rejected() {
        let child = must(Fifo::new(2));
        let wrapper = must(MeasuredQdisc::new(1, child, TickSource::Fast));
        let extra = must(Fifo::new(3));
        assert!(wrapper.try_add_child(extra).is_err());
    }
}
