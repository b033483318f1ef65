//! Round-robin classful qdisc
//!
//! Children are served in rotation. Cursors live per worker id so that one
//! worker's back-track replays its own previous step without corrupting
//! another worker's view; `on_worker_terminated` prunes the slots.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::SchedResult;
use crate::workload::Workload;

use super::{
    check_handle, check_no_duplicate_handles, classify_child, route_through_children,
    BubbleNotifier, ChildEntry, Classifier, ClassfulQdisc, ClassifyState, Handle, HasParentLink,
    ParentLink, Qdisc, RoutingPath, RoutingPathNode, WorkScheduledNotifier,
};

#[derive(Debug, Clone, Copy, Default)]
struct WorkerCursor {
    /// Child offset the next fresh dequeue starts at
    next: usize,
    /// Child offset that served the previous dequeue
    last_served: usize,
}

/// Classful round-robin discipline
pub struct RoundRobin {
    handle: Handle,
    children: RwLock<Vec<ChildEntry>>,
    cursors: DashMap<usize, WorkerCursor>,
    parent: ParentLink,
    weak_self: Weak<RoundRobin>,
}

impl RoundRobin {
    /// Create an empty round-robin qdisc
    pub fn new(handle: Handle) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            children: RwLock::new(Vec::new()),
            cursors: DashMap::new(),
            parent: ParentLink::new(),
            weak_self: weak_self.clone(),
        }))
    }

    /// Attach a leaf child with an optional classifier
    pub fn add_leaf(
        &self,
        child: Arc<dyn Qdisc>,
        classifier: Option<Classifier>,
    ) -> SchedResult<()> {
        self.add_entry(ChildEntry::leaf(child, classifier))
    }

    /// Attach a classful child with an optional classifier
    pub fn add_inner(
        &self,
        child: Arc<dyn ClassfulQdisc>,
        classifier: Option<Classifier>,
    ) -> SchedResult<()> {
        self.add_entry(ChildEntry::inner(child, classifier))
    }

    fn add_entry(&self, entry: ChildEntry) -> SchedResult<()> {
        let mut children = self.children.write();
        let mut existing = vec![self.handle];
        for present in children.iter() {
            present.qdisc.for_each_handle(&mut |handle| existing.push(handle));
        }
        check_no_duplicate_handles(&existing, &entry.qdisc)?;
        entry
            .qdisc
            .initialize(Arc::new(BubbleNotifier(self.weak_self.clone())))?;
        children.push(entry);
        Ok(())
    }

    fn as_classful(&self) -> Arc<dyn ClassfulQdisc> {
        match self.weak_self.upgrade() {
            Some(strong) => strong,
            None => unreachable!("self-reference outlives the qdisc"),
        }
    }
}

impl HasParentLink for RoundRobin {
    fn parent_link(&self) -> &ParentLink {
        &self.parent
    }

    fn link_handle(&self) -> Handle {
        self.handle
    }
}

impl Qdisc for RoundRobin {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.children.read().iter().all(|entry| entry.qdisc.is_empty())
    }

    fn best_effort_count(&self) -> usize {
        self.children
            .read()
            .iter()
            .map(|entry| entry.qdisc.best_effort_count())
            .sum()
    }

    fn enqueue(&self, workload: Workload, state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        // Fail fast before touching a child when this node is detached.
        let _guard = self.parent.pin(self.handle)?;
        let children = self.children.read();
        match classify_child(children.iter(), state) {
            Some(entry) => entry.qdisc.enqueue(workload, state),
            None => Err(crate::error::SchedError::NoRoute(self.handle)),
        }
    }

    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<Workload> {
        let children = self.children.read();
        if children.is_empty() {
            return None;
        }

        let cursor = self
            .cursors
            .get(&worker_id)
            .map(|entry| *entry.value())
            .unwrap_or_default();
        // A back-track repeats the previous logical step from the child that
        // served it, so the rotation does not advance a second time.
        let start = if backtrack { cursor.last_served } else { cursor.next };

        for step in 0..children.len() {
            let offset = (start + step) % children.len();
            let child_backtrack = backtrack && offset == cursor.last_served;
            if let Some(workload) = children[offset].qdisc.try_dequeue(worker_id, child_backtrack) {
                self.cursors.insert(
                    worker_id,
                    WorkerCursor {
                        next: (offset + 1) % children.len(),
                        last_served: offset,
                    },
                );
                return Some(workload);
            }
        }
        None
    }

    fn try_peek(&self, worker_id: usize) -> Option<Workload> {
        let children = self.children.read();
        if children.is_empty() {
            return None;
        }
        let start = self
            .cursors
            .get(&worker_id)
            .map(|entry| entry.value().next)
            .unwrap_or_default();
        for step in 0..children.len() {
            let offset = (start + step) % children.len();
            if let Some(workload) = children[offset].qdisc.try_peek(worker_id) {
                return Some(workload);
            }
        }
        None
    }

    fn try_remove(&self, workload: &Workload) -> bool {
        self.children
            .read()
            .iter()
            .any(|entry| entry.qdisc.try_remove(workload))
    }

    fn on_worker_terminated(&self, worker_id: usize) {
        self.cursors.remove(&worker_id);
        for entry in self.children.read().iter() {
            entry.qdisc.on_worker_terminated(worker_id);
        }
    }

    fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()> {
        self.parent.initialize(self.handle, parent)
    }

    fn complete(&self) {
        self.parent.complete();
        for entry in self.children.read().iter() {
            entry.qdisc.complete();
        }
    }

    fn for_each_handle(&self, visit: &mut dyn FnMut(Handle)) {
        visit(self.handle);
        for entry in self.children.read().iter() {
            entry.qdisc.for_each_handle(visit);
        }
    }
}

impl ClassfulQdisc for RoundRobin {
    fn try_add_child(&self, child: Arc<dyn Qdisc>) -> SchedResult<()> {
        self.add_leaf(child, None)
    }

    fn try_remove_child(&self, handle: Handle) -> bool {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|entry| entry.qdisc.handle() != handle);
        children.len() != before
    }

    fn try_find_child(&self, handle: Handle) -> Option<Arc<dyn Qdisc>> {
        self.children
            .read()
            .iter()
            .find(|entry| entry.qdisc.handle() == handle)
            .map(|entry| entry.qdisc.clone())
    }

    fn try_find_route(&self, handle: Handle, path: &mut RoutingPath) -> bool {
        let children = self.children.read();
        route_through_children(&self.as_classful(), children.iter(), handle, path)
    }

    fn will_enqueue_from_routing_path(&self, _node: &RoutingPathNode, _workload: &Workload) {}
}

impl std::fmt::Debug for RoundRobin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundRobin")
            .field("handle", &self.handle)
            .field("children", &self.children.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdisc::fifo::Fifo;
    use crate::qdisc::test_util::{must, unit_workload as workload, NullNotifier};
    use crate::workload::DequeueDecision;

    fn tree() -> (Arc<RoundRobin>, Arc<Fifo>, Arc<Fifo>) {
        let parent = must(RoundRobin::new(1));
        let child_a = must(Fifo::new(10));
        let child_b = must(Fifo::new(11));
        must(parent.add_leaf(child_a.clone(), None));
        must(parent.add_leaf(child_b.clone(), None));
        parent.initialize(Arc::new(NullNotifier)).ok();
        (parent, child_a, child_b)
    }

    #[test]
    fn test_children_alternate() {
        let (parent, child_a, child_b) = tree();
        let a: Vec<_> = (0..2).map(|_| workload()).collect();
        let b: Vec<_> = (0..2).map(|_| workload()).collect();
        for w in &a {
            child_a.enqueue(w.clone(), None).ok();
        }
        for w in &b {
            child_b.enqueue(w.clone(), None).ok();
        }

        // A then B then A then B, regardless of per-child backlog.
        for expected in [&a[0], &b[0], &a[1], &b[1]] {
            let got = parent.try_dequeue(0, false);
            assert!(got.is_some_and(|w| w.same_as(expected)));
        }
        assert_eq!(parent.best_effort_count(), 0);
    }

    #[test]
    fn test_duplicate_child_handle_rejected() {
        let parent = must(RoundRobin::new(1));
        must(parent.add_leaf(must(Fifo::new(10)) as Arc<dyn Qdisc>, None));
        let duplicate = must(Fifo::new(10));
        assert!(parent.add_leaf(duplicate, None).is_err());
    }

    #[test]
    fn test_backtrack_repeats_the_same_step() {
        let (parent, child_a, child_b) = tree();

        let doomed = workload();
        child_a.enqueue(doomed.clone(), None).ok();
        let survivor = workload();
        child_b.enqueue(survivor.clone(), None).ok();

        // Cancel A's workload before a worker reaches it.
        doomed.request_cancellation();

        let got = parent.try_dequeue(0, false);
        assert!(got.as_ref().is_some_and(|w| w.same_as(&doomed)));
        assert_eq!(
            got.as_ref().map(|w| w.begin_dequeue()),
            Some(DequeueDecision::AlreadyCanceled)
        );

        // Back-track: child A is tried again (now empty), then B yields.
        let got = parent.try_dequeue(0, true);
        assert!(got.is_some_and(|w| w.same_as(&survivor)));

        // The rotation advanced one logical step: the next fresh dequeue
        // starts back at child A.
        let from_a = workload();
        child_a.enqueue(from_a.clone(), None).ok();
        child_b.enqueue(workload(), None).ok();
        let next = parent.try_dequeue(0, false);
        assert!(next.is_some_and(|w| w.same_as(&from_a)));
    }

    #[test]
    fn test_worker_cursors_are_independent() {
        let (parent, child_a, child_b) = tree();
        child_a.enqueue(workload(), None).ok();
        child_b.enqueue(workload(), None).ok();

        assert!(parent.try_dequeue(0, false).is_some());
        // Worker 1 starts its own rotation at child A's slot.
        assert!(parent.try_dequeue(1, false).is_some());

        parent.on_worker_terminated(0);
        assert!(!parent.cursors.contains_key(&0));
        assert!(parent.cursors.contains_key(&1));
    }

    #[test]
    fn test_route_to_grandchild() {
        let root = must(RoundRobin::new(1));
        let inner = must(RoundRobin::new(2));
        let leaf = must(Fifo::new(3));
        must(inner.add_leaf(leaf.clone(), None));
        must(root.add_inner(inner, None));
        root.initialize(Arc::new(NullNotifier)).ok();

        let mut path = RoutingPath::new();
        assert!(root.try_find_route(3, &mut path));
        assert!(path.is_complete());
        assert_eq!(path.nodes().len(), 2);
        assert_eq!(path.nodes()[0].handle, 1);
        assert_eq!(path.nodes()[1].handle, 2);
        assert!(path.target().is_some_and(|t| t.handle() == 3));

        let mut missing = RoutingPath::new();
        assert!(!root.try_find_route(99, &mut missing));
        assert!(!missing.is_complete());
    }
}
