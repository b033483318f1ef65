//! Queuing disciplines
//!
//! A scheduling tree is composed of qdiscs: classful inner nodes that route
//! and select among children, and classless leaves that store workloads.
//! Producers enqueue at the root (by classification or by target handle);
//! the accepting leaf notifies its parent, the notification bubbles to the
//! root, and the worker pool draws workloads back down through the same
//! tree according to each node's policy.

pub mod edd;
pub mod fair;
pub mod fifo;
pub mod lifo;
pub mod measured;
pub mod priority;
pub mod ring;
pub mod round_robin;
pub mod routing;

pub use edd::EarliestDueDate;
pub use fair::{Fair, FairnessConfig, PreferredFairness, TimeModel};
pub use fifo::Fifo;
pub use lifo::Lifo;
pub use measured::MeasuredQdisc;
pub use priority::{PriorityFifoFast, PriorityFifoLocking};
pub use ring::{ConstrainedFifo, ConstrainedLifo, PrioritizationPolicy};
pub use round_robin::RoundRobin;
pub use routing::{RoutingPath, RoutingPathNode};

use std::any::Any;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::error::{SchedError, SchedResult};
use crate::workload::Workload;

/// Identifier of a qdisc within one tree
///
/// The unsigned default (zero) is reserved and rejected everywhere a handle
/// is accepted.
pub type Handle = u64;

/// Validate a user-supplied handle
pub fn check_handle(handle: Handle) -> SchedResult<()> {
    if handle == 0 {
        return Err(SchedError::DefaultHandle);
    }
    Ok(())
}

/// Producer-supplied classification state
///
/// Implemented for every `Any + Send + Sync` type; classifier predicates
/// downcast to their concrete state type.
pub trait ClassifyState: Send + Sync {
    /// Type-erased view for classifier downcasts
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Send + Sync> ClassifyState for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Type-erased classifier predicate mapping state to a child
pub type Classifier = Box<dyn Fn(&dyn ClassifyState) -> bool + Send + Sync>;

/// Build a classifier from a typed predicate
///
/// States of a different concrete type never match.
pub fn classifier<T, F>(predicate: F) -> Classifier
where
    T: Any + Send + Sync,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Box::new(move |state| {
        state
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(&predicate)
    })
}

/// Upward "work scheduled" notification target
///
/// Implemented by classful qdiscs for their children and by the worker gate
/// for the root.
pub trait WorkScheduledNotifier: Send + Sync {
    /// A workload was committed somewhere in the notifying subtree
    fn on_work_scheduled(&self);
}

enum ParentSlot {
    /// Not yet part of a tree; enqueues are scheduling errors
    Uninit,
    /// Wired to a parent notifier
    Active(Arc<dyn WorkScheduledNotifier>),
    /// Completed; enqueues are scheduling errors, nothing is mutated
    Completed,
}

/// Parent linkage of a qdisc, starting at the uninitialized sentinel
///
/// `initialize` installs the parent exactly once; `complete` swaps in the
/// completed sentinel. Holding a [`NotifyGuard`] across an enqueue keeps the
/// link pinned so the publish-then-notify pair cannot straddle a completion.
pub struct ParentLink {
    slot: RwLock<ParentSlot>,
}

impl Default for ParentLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ParentLink {
    /// New link in the uninitialized sentinel state
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(ParentSlot::Uninit),
        }
    }

    /// Install the parent notifier; double-initialization is fatal
    pub fn initialize(
        &self,
        handle: Handle,
        parent: Arc<dyn WorkScheduledNotifier>,
    ) -> SchedResult<()> {
        let mut slot = self.slot.write();
        match *slot {
            ParentSlot::Uninit => {
                *slot = ParentSlot::Active(parent);
                Ok(())
            }
            _ => Err(SchedError::AlreadyInitialized(handle)),
        }
    }

    /// Swap in the completed sentinel, detaching the parent
    pub fn complete(&self) {
        *self.slot.write() = ParentSlot::Completed;
    }

    /// Pin the active parent for the duration of an enqueue
    ///
    /// Recursive reads are allowed: a continuation fired while a pin is held
    /// may legitimately enqueue into the same tree.
    pub fn pin(&self, handle: Handle) -> SchedResult<NotifyGuard<'_>> {
        let slot = self.slot.read_recursive();
        match &*slot {
            ParentSlot::Uninit => Err(SchedError::NotInitialized(handle)),
            ParentSlot::Completed => Err(SchedError::Completed(handle)),
            ParentSlot::Active(parent) => {
                let parent = parent.clone();
                Ok(NotifyGuard {
                    _slot: slot,
                    parent,
                })
            }
        }
    }
}

impl std::fmt::Debug for ParentLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.slot.read() {
            ParentSlot::Uninit => "uninitialized",
            ParentSlot::Active(_) => "active",
            ParentSlot::Completed => "completed",
        };
        f.debug_struct("ParentLink").field("state", &state).finish()
    }
}

/// Pinned parent notifier for one enqueue
pub struct NotifyGuard<'a> {
    _slot: parking_lot::RwLockReadGuard<'a, ParentSlot>,
    parent: Arc<dyn WorkScheduledNotifier>,
}

impl NotifyGuard<'_> {
    /// Signal "work scheduled" upward; call after the workload is published
    pub fn notify(&self) {
        self.parent.on_work_scheduled();
    }
}

/// A node in the scheduling tree
pub trait Qdisc: Send + Sync {
    /// The qdisc's handle, unique within its tree
    fn handle(&self) -> Handle;

    /// Whether the subtree is empty; `true` is a strong guarantee
    ///
    /// A `false` may be phantom: a concurrent producer may have committed an
    /// enqueue without having signaled the parent yet, so dequeue attempts
    /// must still be allowed.
    fn is_empty(&self) -> bool;

    /// Over-approximated workload count; `0` iff the subtree is truly empty
    fn best_effort_count(&self) -> usize;

    /// Accept a workload, classifying it down to a leaf
    fn enqueue(&self, workload: Workload, state: Option<&dyn ClassifyState>) -> SchedResult<()>;

    /// Yield the next workload per this qdisc's policy
    ///
    /// `backtrack` signals that the previously yielded workload was not
    /// executed; the qdisc must treat this call as a repeat of the previous
    /// logical step so its cursors do not advance twice.
    fn try_dequeue(&self, worker_id: usize, backtrack: bool) -> Option<Workload>;

    /// Observe the next candidate without removing it; the value may be stale
    fn try_peek(&self, worker_id: usize) -> Option<Workload>;

    /// Best-effort removal; `false` when unsupported or not found
    fn try_remove(&self, workload: &Workload) -> bool;

    /// Prune any per-worker cursor state for a retired worker
    fn on_worker_terminated(&self, worker_id: usize);

    /// Wire this qdisc to its parent notifier; fatal when repeated
    fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()>;

    /// Detach from the tree; future enqueues fail with a scheduling error
    fn complete(&self);

    /// Visit every handle in the subtree (uniqueness validation)
    fn for_each_handle(&self, visit: &mut dyn FnMut(Handle)) {
        visit(self.handle());
    }
}

/// A qdisc with children and a classifier
pub trait ClassfulQdisc: Qdisc {
    /// Attach a child; rejects duplicate handles within the subtree
    fn try_add_child(&self, child: Arc<dyn Qdisc>) -> SchedResult<()>;

    /// Detach a child by handle; `false` when absent
    fn try_remove_child(&self, handle: Handle) -> bool;

    /// Find a direct child by handle
    fn try_find_child(&self, handle: Handle) -> Option<Arc<dyn Qdisc>>;

    /// Resolve a route to `handle` anywhere in the subtree
    fn try_find_route(&self, handle: Handle, path: &mut RoutingPath) -> bool;

    /// Pre-update routing-dependent state before a handle-addressed enqueue
    /// reaches the leaf
    fn will_enqueue_from_routing_path(&self, node: &RoutingPathNode, workload: &Workload) {
        let _ = (node, workload);
    }
}

/// Validate that `child`'s subtree introduces no duplicate handles under
/// `parent_handles`
pub(crate) fn check_no_duplicate_handles(
    existing: &[Handle],
    child: &Arc<dyn Qdisc>,
) -> SchedResult<()> {
    let mut duplicate = None;
    child.for_each_handle(&mut |handle| {
        if duplicate.is_none() && existing.contains(&handle) {
            duplicate = Some(handle);
        }
    });
    match duplicate {
        Some(handle) => Err(SchedError::DuplicateHandle(handle)),
        None => Ok(()),
    }
}

/// Access to a qdisc's parent linkage for notification bubbling
pub(crate) trait HasParentLink: Send + Sync {
    fn parent_link(&self) -> &ParentLink;
    fn link_handle(&self) -> Handle;
}

/// Child-side notifier that forwards "work scheduled" up through the owning
/// classful qdisc's own parent link
pub(crate) struct BubbleNotifier<T: HasParentLink>(pub(crate) Weak<T>);

impl<T: HasParentLink> WorkScheduledNotifier for BubbleNotifier<T> {
    fn on_work_scheduled(&self) {
        let Some(qdisc) = self.0.upgrade() else { return };
        // A completed or detached node swallows the signal; existing workers
        // still drain whatever the subtree holds.
        let handle = qdisc.link_handle();
        if let Ok(guard) = qdisc.parent_link().pin(handle) {
            guard.notify();
        };
    }
}

/// Child slot of a classful qdisc
pub(crate) struct ChildEntry {
    pub(crate) qdisc: Arc<dyn Qdisc>,
    pub(crate) routable: Option<Arc<dyn ClassfulQdisc>>,
    pub(crate) classifier: Option<Classifier>,
}

impl ChildEntry {
    pub(crate) fn leaf(qdisc: Arc<dyn Qdisc>, classifier: Option<Classifier>) -> Self {
        Self {
            qdisc,
            routable: None,
            classifier,
        }
    }

    pub(crate) fn inner(qdisc: Arc<dyn ClassfulQdisc>, classifier: Option<Classifier>) -> Self {
        Self {
            qdisc: qdisc.clone(),
            routable: Some(qdisc),
            classifier,
        }
    }
}

/// Pick the child a classified enqueue goes to: first matching classifier,
/// then the first catch-all child, then the first child
pub(crate) fn classify_child<'a>(
    children: impl Iterator<Item = &'a ChildEntry> + Clone,
    state: Option<&dyn ClassifyState>,
) -> Option<&'a ChildEntry> {
    if let Some(state) = state {
        if let Some(entry) = children
            .clone()
            .find(|entry| entry.classifier.as_ref().is_some_and(|matches| matches(state)))
        {
            return Some(entry);
        }
    }
    children
        .clone()
        .find(|entry| entry.classifier.is_none())
        .or_else(|| {
            let mut first = children;
            first.next()
        })
}

/// Depth-first route resolution through a child list
pub(crate) fn route_through_children<'a>(
    via: &Arc<dyn ClassfulQdisc>,
    children: impl Iterator<Item = &'a ChildEntry> + Clone,
    handle: Handle,
    path: &mut RoutingPath,
) -> bool {
    for (offset, entry) in children.clone().enumerate() {
        if entry.qdisc.handle() == handle {
            path.push(RoutingPathNode {
                qdisc: via.clone(),
                handle: via.handle(),
                child_offset: offset,
            });
            path.set_target(entry.qdisc.clone());
            return true;
        }
    }
    for (offset, entry) in children.enumerate() {
        if let Some(routable) = &entry.routable {
            let depth = path.depth();
            path.push(RoutingPathNode {
                qdisc: via.clone(),
                handle: via.handle(),
                child_offset: offset,
            });
            if routable.try_find_route(handle, path) {
                return true;
            }
            path.truncate(depth);
        }
    }
    false
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::workload::payload::Payload;

    /// Notifier that swallows work-scheduled signals
    pub(crate) struct NullNotifier;

    impl WorkScheduledNotifier for NullNotifier {
        fn on_work_scheduled(&self) {}
    }

    /// Fresh unit workload for queue tests
    pub(crate) fn unit_workload() -> Workload {
        let (payload, id) = Payload::unit(|_ctx| {});
        Workload::new(payload, id, None, false)
    }

    /// Construct-or-panic helper for qdisc tests
    pub(crate) fn must<T>(result: SchedResult<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected scheduling error: {err}"),
        }
    }
}
