//! Builders for factories and qdisc trees
//!
//! The factory builder uses the type-state pattern so an incomplete
//! configuration cannot build: the root qdisc must be supplied before
//! `build()` exists. The tree builder composes classful qdiscs from nested
//! builders and typed classification predicates, deferring construction so
//! the factory's log sink reaches every constrained ring in the tree.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{SchedError, SchedResult};
use crate::logsink::{LogSink, TracingSink};
use crate::pool::dispatch::{Dispatch, SingleThreadContext, ThreadDispatch};
use crate::pool::factory::WorkloadFactory;
use crate::pool::provider::ServiceProviderFactory;
use crate::pool::worker::{WorkerGate, WorkerPool};
use crate::qdisc::priority::BandSelector;
use crate::qdisc::{
    classifier, ClassfulQdisc, Classifier, ClassifyState, ConstrainedFifo, ConstrainedLifo,
    EarliestDueDate, Fair, FairnessConfig, Fifo, Handle, Lifo, MeasuredQdisc, PrioritizationPolicy,
    PriorityFifoFast, PriorityFifoLocking, Qdisc, RoundRobin,
};
use crate::vtime::TickSource;

/// Marker trait for factory-builder states
pub trait BuilderState: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
}

/// Initial state: needs a root qdisc
#[derive(Debug, Clone, Copy)]
pub struct NeedsRoot;

/// State: root supplied, ready to build
#[derive(Debug, Clone, Copy)]
pub struct HasRoot;

impl sealed::Sealed for NeedsRoot {}
impl sealed::Sealed for HasRoot {}
impl BuilderState for NeedsRoot {}
impl BuilderState for HasRoot {}

struct RootSpec {
    qdisc: Arc<dyn Qdisc>,
    classful: Option<Arc<dyn ClassfulQdisc>>,
}

/// Type-safe builder for [`WorkloadFactory`]
///
/// # Example
///
/// ```rust,ignore
/// let factory = WorkloadFactoryBuilder::new()
///     .max_concurrency(4)
///     .root_tree(QdiscTreeBuilder::round_robin(1)
///         .child(QdiscTreeBuilder::fifo(2))
///         .child(QdiscTreeBuilder::fifo(3)))?
///     .build()?;
/// ```
pub struct WorkloadFactoryBuilder<S: BuilderState> {
    max_concurrency: usize,
    dispatch: Arc<dyn Dispatch>,
    sink: Arc<dyn LogSink>,
    provider: Option<Arc<dyn ServiceProviderFactory>>,
    flow_execution_context: bool,
    captured_context: Option<Arc<dyn SingleThreadContext>>,
    anonymous_workload_pooling: bool,
    root: Option<RootSpec>,
    _state: PhantomData<S>,
}

impl Default for WorkloadFactoryBuilder<NeedsRoot> {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkloadFactoryBuilder<NeedsRoot> {
    /// Builder with default concurrency, OS-thread dispatch, and tracing sink
    pub fn new() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            max_concurrency: parallelism,
            dispatch: Arc::new(ThreadDispatch),
            sink: Arc::new(TracingSink),
            provider: None,
            flow_execution_context: false,
            captured_context: None,
            anonymous_workload_pooling: false,
            root: None,
            _state: PhantomData,
        }
    }

    fn into_has_root(self, root: RootSpec) -> WorkloadFactoryBuilder<HasRoot> {
        WorkloadFactoryBuilder {
            max_concurrency: self.max_concurrency,
            dispatch: self.dispatch,
            sink: self.sink,
            provider: self.provider,
            flow_execution_context: self.flow_execution_context,
            captured_context: self.captured_context,
            anonymous_workload_pooling: self.anonymous_workload_pooling,
            root: Some(root),
            _state: PhantomData,
        }
    }

    /// Use an already-constructed leaf root
    pub fn root(self, root: Arc<dyn Qdisc>) -> WorkloadFactoryBuilder<HasRoot> {
        self.into_has_root(RootSpec {
            qdisc: root,
            classful: None,
        })
    }

    /// Use an already-constructed classful root
    pub fn root_classful(self, root: Arc<dyn ClassfulQdisc>) -> WorkloadFactoryBuilder<HasRoot> {
        self.into_has_root(RootSpec {
            qdisc: root.clone(),
            classful: Some(root),
        })
    }

    /// Use a plain FIFO root with the given handle
    pub fn root_fifo(self, handle: Handle) -> SchedResult<WorkloadFactoryBuilder<HasRoot>> {
        let root = Fifo::new(handle)?;
        Ok(self.root(root))
    }

    /// Build the root from a tree builder, threading the factory's sink
    pub fn root_tree(
        self,
        tree: QdiscTreeBuilder,
    ) -> SchedResult<WorkloadFactoryBuilder<HasRoot>> {
        let built = tree.build_with_sink(self.sink.clone())?;
        Ok(self.into_has_root(built))
    }
}

impl<S: BuilderState> WorkloadFactoryBuilder<S> {
    /// Cap the worker pool at `n` concurrent workers (minimum 1)
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Dispatch worker loops onto the given ambient pool
    pub fn dispatch(mut self, dispatch: Arc<dyn Dispatch>) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Record diagnostics on the given sink
    pub fn log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Hand each worker a scoped service provider
    pub fn service_provider(mut self, provider: Arc<dyn ServiceProviderFactory>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Propagate the scheduling-time `tracing` span into continuations
    pub fn flow_execution_context(mut self, flow: bool) -> Self {
        self.flow_execution_context = flow;
        self
    }

    /// Post continuations back onto the given single-threaded context
    pub fn continue_on_captured_context(
        mut self,
        context: Arc<dyn SingleThreadContext>,
    ) -> Self {
        self.captured_context = Some(context);
        self
    }

    /// Recycle continuation buffers for small fire-and-forget workloads
    pub fn anonymous_workload_pooling(mut self, pooling: bool) -> Self {
        self.anonymous_workload_pooling = pooling;
        self
    }
}

impl WorkloadFactoryBuilder<HasRoot> {
    /// Wire the pool, validate the tree, and produce the factory
    pub fn build(self) -> SchedResult<WorkloadFactory> {
        let Some(root) = self.root else {
            unreachable!("the HasRoot state always carries a root");
        };

        // Tree-wide handle uniqueness; child attachment already checks each
        // subtree, this covers hand-assembled roots.
        let mut handles = Vec::new();
        root.qdisc.for_each_handle(&mut |handle| handles.push(handle));
        for (index, handle) in handles.iter().enumerate() {
            if *handle == 0 {
                return Err(SchedError::DefaultHandle);
            }
            if handles[..index].contains(handle) {
                return Err(SchedError::DuplicateHandle(*handle));
            }
        }

        let pool = WorkerPool::new(
            root.qdisc.clone(),
            self.dispatch,
            self.max_concurrency,
            self.sink.clone(),
            self.provider,
        );
        root.qdisc.initialize(Arc::new(WorkerGate::new(&pool)))?;

        Ok(WorkloadFactory::assemble(
            root.qdisc,
            root.classful,
            pool,
            self.flow_execution_context,
            self.captured_context,
            self.anonymous_workload_pooling,
            self.sink,
        ))
    }
}

/// Convenience: factory with a FIFO root and default knobs
impl WorkloadFactory {
    /// FIFO-rooted factory with defaults (handle 1)
    pub fn with_defaults() -> SchedResult<Self> {
        WorkloadFactoryBuilder::new().root_fifo(1)?.build()
    }
}

enum LeafKind {
    Fifo,
    Lifo,
    ConstrainedFifo {
        capacity: usize,
        policy: PrioritizationPolicy,
    },
    ConstrainedLifo {
        capacity: usize,
        policy: PrioritizationPolicy,
    },
    Priority {
        bands: usize,
        default_band: usize,
        selector: Option<BandSelector>,
        band_handles: Vec<Option<Handle>>,
        locking: bool,
    },
}

enum TreeNode {
    Leaf {
        handle: Handle,
        kind: LeafKind,
    },
    RoundRobin {
        handle: Handle,
        children: Vec<(TreeNode, Option<Classifier>)>,
    },
    Fair {
        handle: Handle,
        config: FairnessConfig,
        inner: InnerDiscipline,
        children: Vec<(TreeNode, Option<Classifier>, u32)>,
    },
    EarliestDueDate {
        handle: Handle,
        default_lateness: Duration,
        children: Vec<(TreeNode, Option<Classifier>)>,
    },
    Measured {
        handle: Handle,
        source: TickSource,
        child: Option<Box<TreeNode>>,
    },
}

/// Local discipline used for implicitly created per-child queues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerDiscipline {
    /// Unbounded FIFO (the default)
    Fifo,
    /// Unbounded LIFO
    Lifo,
}

/// Composable builder for one position in a scheduling tree
pub struct QdiscTreeBuilder {
    node: TreeNode,
    error: Option<SchedError>,
}

impl QdiscTreeBuilder {
    fn leaf(handle: Handle, kind: LeafKind) -> Self {
        Self {
            node: TreeNode::Leaf { handle, kind },
            error: None,
        }
    }

    fn misuse(mut self, handle: Handle, what: &str) -> Self {
        if self.error.is_none() {
            self.error = Some(SchedError::InvariantViolation(handle, what.to_string()));
        }
        self
    }

    /// Unbounded FIFO leaf
    pub fn fifo(handle: Handle) -> Self {
        Self::leaf(handle, LeafKind::Fifo)
    }

    /// Unbounded LIFO leaf
    pub fn lifo(handle: Handle) -> Self {
        Self::leaf(handle, LeafKind::Lifo)
    }

    /// Bounded FIFO ring
    pub fn constrained_fifo(
        handle: Handle,
        capacity: usize,
        policy: PrioritizationPolicy,
    ) -> Self {
        Self::leaf(handle, LeafKind::ConstrainedFifo { capacity, policy })
    }

    /// Bounded LIFO ring
    pub fn constrained_lifo(
        handle: Handle,
        capacity: usize,
        policy: PrioritizationPolicy,
    ) -> Self {
        Self::leaf(handle, LeafKind::ConstrainedLifo { capacity, policy })
    }

    /// Strict-priority leaf with the bitmap fast path
    pub fn priority(handle: Handle, bands: usize) -> Self {
        Self::leaf(
            handle,
            LeafKind::Priority {
                bands,
                default_band: 0,
                selector: None,
                band_handles: Vec::new(),
                locking: false,
            },
        )
    }

    /// Strict-priority leaf behind a coarse mutex
    pub fn priority_locking(handle: Handle, bands: usize) -> Self {
        Self::leaf(
            handle,
            LeafKind::Priority {
                bands,
                default_band: 0,
                selector: None,
                band_handles: Vec::new(),
                locking: true,
            },
        )
    }

    /// Band a workload lands in when nothing else classifies it
    pub fn default_band(mut self, band: usize) -> Self {
        match &mut self.node {
            TreeNode::Leaf {
                kind: LeafKind::Priority { default_band, .. },
                ..
            } => {
                *default_band = band;
                self
            }
            _ => {
                let handle = self.handle();
                self.misuse(handle, "default_band applies to priority qdiscs")
            }
        }
    }

    /// Typed band selector on the classification state
    pub fn band_selector<T, F>(mut self, select: F) -> Self
    where
        T: std::any::Any + Send + Sync,
        F: Fn(&T) -> Option<usize> + Send + Sync + 'static,
    {
        match &mut self.node {
            TreeNode::Leaf {
                kind: LeafKind::Priority { selector, .. },
                ..
            } => {
                *selector = Some(Box::new(move |state: &dyn ClassifyState| {
                    state.as_any().downcast_ref::<T>().and_then(&select)
                }));
                self
            }
            _ => {
                let handle = self.handle();
                self.misuse(handle, "band_selector applies to priority qdiscs")
            }
        }
    }

    /// Addressable handles for individual priority bands
    pub fn band_handles(mut self, handles: Vec<Option<Handle>>) -> Self {
        match &mut self.node {
            TreeNode::Leaf {
                kind: LeafKind::Priority { band_handles, .. },
                ..
            } => {
                *band_handles = handles;
                self
            }
            _ => {
                let handle = self.handle();
                self.misuse(handle, "band_handles applies to priority qdiscs")
            }
        }
    }

    /// Round-robin classful node
    pub fn round_robin(handle: Handle) -> Self {
        Self {
            node: TreeNode::RoundRobin {
                handle,
                children: Vec::new(),
            },
            error: None,
        }
    }

    /// Weighted-fair classful node with default knobs
    pub fn fair(handle: Handle) -> Self {
        Self::fair_with(handle, FairnessConfig::default())
    }

    /// Weighted-fair classful node with explicit knobs
    pub fn fair_with(handle: Handle, config: FairnessConfig) -> Self {
        Self {
            node: TreeNode::Fair {
                handle,
                config,
                inner: InnerDiscipline::Fifo,
                children: Vec::new(),
            },
            error: None,
        }
    }

    /// Earliest-due-date classful node
    pub fn earliest_due_date(handle: Handle) -> Self {
        Self {
            node: TreeNode::EarliestDueDate {
                handle,
                default_lateness: crate::qdisc::edd::DEFAULT_LATENESS,
                children: Vec::new(),
            },
            error: None,
        }
    }

    /// Measurement wrapper around a single child
    pub fn measured(handle: Handle, source: TickSource) -> Self {
        Self {
            node: TreeNode::Measured {
                handle,
                source,
                child: None,
            },
            error: None,
        }
    }

    fn handle(&self) -> Handle {
        match &self.node {
            TreeNode::Leaf { handle, .. }
            | TreeNode::RoundRobin { handle, .. }
            | TreeNode::Fair { handle, .. }
            | TreeNode::EarliestDueDate { handle, .. }
            | TreeNode::Measured { handle, .. } => *handle,
        }
    }

    fn absorb(&mut self, child: &mut QdiscTreeBuilder) {
        if self.error.is_none() {
            self.error = child.error.take();
        }
    }

    /// Attach a child with no classifier
    pub fn child(self, child: QdiscTreeBuilder) -> Self {
        self.child_inner(child, None, 1)
    }

    /// Attach a child selected by a typed predicate
    pub fn child_classified<T, F>(self, child: QdiscTreeBuilder, predicate: F) -> Self
    where
        T: std::any::Any + Send + Sync,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.child_inner(child, Some(classifier::<T, F>(predicate)), 1)
    }

    /// Attach a weighted child (fair nodes)
    pub fn weighted_child(self, child: QdiscTreeBuilder, weight: u32) -> Self {
        self.child_inner(child, None, weight)
    }

    /// Attach a weighted child selected by a typed predicate (fair nodes)
    pub fn weighted_child_classified<T, F>(
        self,
        child: QdiscTreeBuilder,
        weight: u32,
        predicate: F,
    ) -> Self
    where
        T: std::any::Any + Send + Sync,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.child_inner(child, Some(classifier::<T, F>(predicate)), weight)
    }

    /// Local discipline for implicitly created fair streams
    pub fn inner_discipline(mut self, discipline: InnerDiscipline) -> Self {
        match &mut self.node {
            TreeNode::Fair { inner, .. } => {
                *inner = discipline;
                self
            }
            _ => {
                let handle = self.handle();
                self.misuse(handle, "inner_discipline applies to fair qdiscs")
            }
        }
    }

    /// Add an implicit per-stream queue to a fair node
    pub fn stream(mut self, handle: Handle, weight: u32) -> Self {
        let discipline = match &self.node {
            TreeNode::Fair { inner, .. } => *inner,
            _ => {
                let own = self.handle();
                return self.misuse(own, "stream applies to fair qdiscs");
            }
        };
        let child = match discipline {
            InnerDiscipline::Fifo => QdiscTreeBuilder::fifo(handle),
            InnerDiscipline::Lifo => QdiscTreeBuilder::lifo(handle),
        };
        match &mut self.node {
            TreeNode::Fair { children, .. } => {
                children.push((child.node, None, weight));
                self
            }
            _ => self,
        }
    }

    fn child_inner(
        mut self,
        mut child: QdiscTreeBuilder,
        classifier: Option<Classifier>,
        weight: u32,
    ) -> Self {
        self.absorb(&mut child);
        match &mut self.node {
            TreeNode::RoundRobin { children, .. } => {
                children.push((child.node, classifier));
                self
            }
            TreeNode::Fair { children, .. } => {
                children.push((child.node, classifier, weight));
                self
            }
            TreeNode::EarliestDueDate { children, .. } => {
                children.push((child.node, classifier));
                self
            }
            TreeNode::Measured { child: slot, .. } => {
                if slot.is_some() {
                    let handle = self.handle();
                    return self.misuse(handle, "measurement wrapper holds exactly one child");
                }
                *slot = Some(Box::new(child.node));
                self
            }
            TreeNode::Leaf { .. } => {
                let handle = self.handle();
                self.misuse(handle, "leaf qdiscs cannot have children")
            }
        }
    }

    /// Build the subtree with a default tracing sink
    pub fn build(self) -> SchedResult<Arc<dyn Qdisc>> {
        self.build_with_sink(Arc::new(TracingSink)).map(|built| built.qdisc)
    }

    fn build_with_sink(self, sink: Arc<dyn LogSink>) -> SchedResult<RootSpec> {
        if let Some(error) = self.error {
            return Err(error);
        }
        build_node(self.node, &sink)
    }
}

fn build_node(node: TreeNode, sink: &Arc<dyn LogSink>) -> SchedResult<RootSpec> {
    match node {
        TreeNode::Leaf { handle, kind } => {
            let qdisc: Arc<dyn Qdisc> = match kind {
                LeafKind::Fifo => Fifo::new(handle)?,
                LeafKind::Lifo => Lifo::new(handle)?,
                LeafKind::ConstrainedFifo { capacity, policy } => {
                    ConstrainedFifo::with_sink(handle, capacity, policy, sink.clone())?
                }
                LeafKind::ConstrainedLifo { capacity, policy } => {
                    ConstrainedLifo::with_sink(handle, capacity, policy, sink.clone())?
                }
                LeafKind::Priority {
                    bands,
                    default_band,
                    selector,
                    band_handles,
                    locking,
                } => {
                    if locking {
                        PriorityFifoLocking::with_config(
                            handle,
                            bands,
                            selector,
                            default_band,
                            band_handles,
                        )?
                    } else {
                        PriorityFifoFast::with_config(
                            handle,
                            bands,
                            selector,
                            default_band,
                            band_handles,
                        )?
                    }
                }
            };
            Ok(RootSpec {
                qdisc,
                classful: None,
            })
        }
        TreeNode::RoundRobin { handle, children } => {
            let qdisc = RoundRobin::new(handle)?;
            for (child, classifier) in children {
                let built = build_node(child, sink)?;
                match built.classful {
                    Some(inner) => qdisc.add_inner(inner, classifier)?,
                    None => qdisc.add_leaf(built.qdisc, classifier)?,
                }
            }
            Ok(RootSpec {
                classful: Some(qdisc.clone()),
                qdisc,
            })
        }
        TreeNode::Fair {
            handle,
            config,
            inner: _,
            children,
        } => {
            let qdisc = Fair::with_config(handle, config)?;
            for (child, classifier, weight) in children {
                let built = build_node(child, sink)?;
                match built.classful {
                    Some(inner) => qdisc.add_inner(inner, classifier, weight)?,
                    None => qdisc.add_leaf(built.qdisc, classifier, weight)?,
                }
            }
            Ok(RootSpec {
                classful: Some(qdisc.clone()),
                qdisc,
            })
        }
        TreeNode::EarliestDueDate {
            handle,
            default_lateness,
            children,
        } => {
            let qdisc = EarliestDueDate::with_default_lateness(handle, default_lateness)?;
            for (child, classifier) in children {
                let built = build_node(child, sink)?;
                match built.classful {
                    Some(inner) => qdisc.add_inner(inner, classifier)?,
                    None => qdisc.add_leaf(built.qdisc, classifier)?,
                }
            }
            Ok(RootSpec {
                classful: Some(qdisc.clone()),
                qdisc,
            })
        }
        TreeNode::Measured {
            handle,
            source,
            child,
        } => {
            let Some(child) = child else {
                return Err(SchedError::InvariantViolation(
                    handle,
                    "measurement wrapper requires exactly one child".to_string(),
                ));
            };
            let built = build_node(*child, sink)?;
            let qdisc = MeasuredQdisc::new(handle, built.qdisc, source)?;
            Ok(RootSpec {
                classful: Some(qdisc.clone()),
                qdisc,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_handle_rejected_at_build() {
        assert_eq!(
            QdiscTreeBuilder::fifo(0).build().err(),
            Some(SchedError::DefaultHandle)
        );
    }

    #[test]
    fn test_leaf_with_child_is_misuse() {
        let result = QdiscTreeBuilder::fifo(1)
            .child(QdiscTreeBuilder::fifo(2))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_duplicate_handles_rejected() {
        let result = QdiscTreeBuilder::round_robin(1)
            .child(QdiscTreeBuilder::fifo(2))
            .child(QdiscTreeBuilder::fifo(2))
            .build();
        assert_eq!(result.err(), Some(SchedError::DuplicateHandle(2)));
    }

    #[test]
    fn test_nested_tree_builds() {
        let result = QdiscTreeBuilder::round_robin(1)
            .child(QdiscTreeBuilder::priority(2, 3).default_band(1))
            .child_classified::<u32, _>(QdiscTreeBuilder::fifo(3), |value| *value > 10)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_fair_streams_use_inner_discipline() {
        let result = QdiscTreeBuilder::fair(1)
            .inner_discipline(InnerDiscipline::Lifo)
            .stream(2, 1)
            .stream(3, 2)
            .build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_factory_builder_requires_nonzero_concurrency() {
        let factory = WorkloadFactoryBuilder::new()
            .max_concurrency(0)
            .root_fifo(1)
            .and_then(|builder| builder.build());
        assert!(factory.is_ok_and(|f| f.max_concurrency() == 1));
    }

    #[test]
    fn test_factory_defaults() {
        let factory = WorkloadFactory::with_defaults();
        assert!(factory.is_ok_and(|f| f.root().handle() == 1));
    }
}
