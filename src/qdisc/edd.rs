//! Earliest-due-date classful qdisc
//!
//! Dequeue inspects each child's next candidate and yields the one with the
//! smallest due date; candidates without a due-date annotation are treated
//! as due after the configured default lateness, and ties break by arrival
//! order. Peeked candidates may be stale; the selection is best-effort by
//! contract.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{SchedError, SchedResult};
use crate::workload::Workload;

use super::{
    check_handle, check_no_duplicate_handles, classify_child, route_through_children,
    BubbleNotifier, ChildEntry, Classifier, ClassfulQdisc, ClassifyState, Handle, HasParentLink,
    ParentLink, Qdisc, RoutingPath, WorkScheduledNotifier,
};

/// Default lateness granted to workloads without a due-date annotation
pub const DEFAULT_LATENESS: Duration = Duration::from_secs(3600);

/// Earliest-due-date discipline
pub struct EarliestDueDate {
    handle: Handle,
    children: RwLock<Vec<ChildEntry>>,
    default_lateness: Duration,
    parent: ParentLink,
    weak_self: Weak<EarliestDueDate>,
}

impl EarliestDueDate {
    /// Create with the default lateness for untagged workloads
    pub fn new(handle: Handle) -> SchedResult<Arc<Self>> {
        Self::with_default_lateness(handle, DEFAULT_LATENESS)
    }

    /// Create with an explicit default lateness
    pub fn with_default_lateness(
        handle: Handle,
        default_lateness: Duration,
    ) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            children: RwLock::new(Vec::new()),
            default_lateness,
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

    /// Sort key of a candidate: effective due date, then arrival order
    fn candidate_key(&self, workload: &Workload, now: Instant) -> (Instant, u64) {
        let due = workload
            .due_date()
            .unwrap_or_else(|| now + self.default_lateness);
        (due, workload.arrival_seq())
    }

    /// Child offset holding the earliest-due candidate
    fn select_offset(&self, children: &[ChildEntry], worker_id: usize) -> Option<usize> {
        let now = Instant::now();
        let mut best: Option<((Instant, u64), usize)> = None;
        for (offset, entry) in children.iter().enumerate() {
            let Some(candidate) = entry.qdisc.try_peek(worker_id) else {
                continue;
            };
            let key = self.candidate_key(&candidate, now);
            if best.as_ref().is_none_or(|(best_key, _)| key < *best_key) {
                best = Some((key, offset));
            }
        }
        best.map(|(_, offset)| offset)
    }
}

impl HasParentLink for EarliestDueDate {
    fn parent_link(&self) -> &ParentLink {
        &self.parent
    }

    fn link_handle(&self) -> Handle {
        self.handle
    }
}

impl Qdisc for EarliestDueDate {
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
        let _guard = self.parent.pin(self.handle)?;
        let children = self.children.read();
        match classify_child(children.iter(), state) {
            Some(entry) => entry.qdisc.enqueue(workload, state),
            None => Err(SchedError::NoRoute(self.handle)),
        }
    }

    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<Workload> {
        let children = self.children.read();
        for _attempt in 0..children.len() {
            let offset = self.select_offset(&children, worker_id)?;
            if let Some(workload) = children[offset].qdisc.try_dequeue(worker_id, backtrack) {
                return Some(workload);
            }
            // The peeked candidate was taken by another worker; reselect.
        }
        None
    }

    fn try_peek(&self, worker_id: usize) -> Option<Workload> {
        let children = self.children.read();
        let offset = self.select_offset(&children, worker_id)?;
        children[offset].qdisc.try_peek(worker_id)
    }

    fn try_remove(&self, workload: &Workload) -> bool {
        self.children
            .read()
            .iter()
            .any(|entry| entry.qdisc.try_remove(workload))
    }

    fn on_worker_terminated(&self, worker_id: usize) {
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

impl ClassfulQdisc for EarliestDueDate {
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
}

impl std::fmt::Debug for EarliestDueDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EarliestDueDate")
            .field("handle", &self.handle)
            .field("children", &self.children.read().len())
            .finish()
    }
}
