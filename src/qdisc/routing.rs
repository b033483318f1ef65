//! Handle-addressed routing
//!
//! A routing path is a short, exclusively owned record of the hops from the
//! root to a target qdisc. Each intermediate classful node is revisited just
//! before the enqueue so it can pre-update routing-dependent state.

use std::sync::Arc;

use super::{ClassfulQdisc, Handle, Qdisc};

/// One hop through a classful qdisc
pub struct RoutingPathNode {
    /// The classful qdisc traversed
    pub qdisc: Arc<dyn ClassfulQdisc>,
    /// Its handle
    pub handle: Handle,
    /// Offset of the chosen child within the qdisc's child order
    pub child_offset: usize,
}

impl std::fmt::Debug for RoutingPathNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingPathNode")
            .field("handle", &self.handle)
            .field("child_offset", &self.child_offset)
            .finish()
    }
}

/// Path from the root to a target qdisc
///
/// Owned by a single enqueue call; never shared or retained.
#[derive(Default)]
pub struct RoutingPath {
    nodes: Vec<RoutingPathNode>,
    target: Option<Arc<dyn Qdisc>>,
}

impl std::fmt::Debug for RoutingPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingPath")
            .field("nodes", &self.nodes)
            .field("target", &self.target.is_some())
            .finish()
    }
}

impl RoutingPath {
    /// Empty path with room for a typical tree depth
    pub fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(4),
            target: None,
        }
    }

    /// Record one traversed hop
    pub fn push(&mut self, node: RoutingPathNode) {
        self.nodes.push(node);
    }

    /// Record the resolved target qdisc
    pub fn set_target(&mut self, target: Arc<dyn Qdisc>) {
        self.target = Some(target);
    }

    /// The resolved target, once routing succeeded
    pub fn target(&self) -> Option<&Arc<dyn Qdisc>> {
        self.target.as_ref()
    }

    /// Traversed hops, root-most first
    pub fn nodes(&self) -> &[RoutingPathNode] {
        &self.nodes
    }

    /// Whether routing resolved a target
    pub fn is_complete(&self) -> bool {
        self.target.is_some()
    }

    /// Drop any partial progress from a failed branch probe
    pub fn truncate(&mut self, depth: usize) {
        self.nodes.truncate(depth);
    }

    /// Current depth
    pub fn depth(&self) -> usize {
        self.nodes.len()
    }
}
