//! Workload factory
//!
//! The producer-facing surface of a scheduling tree: it owns the root qdisc
//! and the worker pool, and turns closures into scheduled workloads. Enqueue
//! paths classify through the root, or route directly to a target handle
//! through an exclusively owned routing path.

use std::time::{Duration, Instant};

use std::sync::Arc;

use crate::error::{SchedError, SchedResult};
use crate::logsink::LogSink;
use crate::qdisc::{ClassfulQdisc, ClassifyState, Handle, Qdisc, RoutingPath};
use crate::workload::payload::Payload;
use crate::workload::{
    CancelToken, Continuation, Workload, WorkloadContext, WorkloadHandle,
};

use super::dispatch::SingleThreadContext;
use super::worker::WorkerPool;

/// Factory binding a root qdisc to a configured worker pool
pub struct WorkloadFactory {
    root: Arc<dyn Qdisc>,
    root_classful: Option<Arc<dyn ClassfulQdisc>>,
    pool: Arc<WorkerPool>,
    flow_execution_context: bool,
    captured_context: Option<Arc<dyn SingleThreadContext>>,
    pooling: bool,
    sink: Arc<dyn LogSink>,
}

impl WorkloadFactory {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        root: Arc<dyn Qdisc>,
        root_classful: Option<Arc<dyn ClassfulQdisc>>,
        pool: Arc<WorkerPool>,
        flow_execution_context: bool,
        captured_context: Option<Arc<dyn SingleThreadContext>>,
        pooling: bool,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        Self {
            root,
            root_classful,
            pool,
            flow_execution_context,
            captured_context,
            pooling,
            sink,
        }
    }

    /// The root of the scheduling tree
    pub fn root(&self) -> &Arc<dyn Qdisc> {
        &self.root
    }

    /// Configured maximum concurrency
    pub fn max_concurrency(&self) -> usize {
        self.pool.max_workers()
    }

    /// Workers currently accounted for
    pub fn current_workers(&self) -> usize {
        self.pool.current_workers()
    }

    /// The diagnostic sink events are recorded on
    pub fn sink(&self) -> &Arc<dyn LogSink> {
        &self.sink
    }

    /// Start building a workload with non-default options
    pub fn workload(&self) -> ScheduleBuilder<'_> {
        ScheduleBuilder {
            factory: self,
            token: None,
            due: None,
            target: None,
        }
    }

    /// Schedule a void payload through root classification
    pub fn schedule<F>(&self, payload: F) -> SchedResult<Workload>
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        self.workload().spawn(payload)
    }

    /// Schedule a void payload with classification state
    pub fn schedule_classified<F>(
        &self,
        state: &dyn ClassifyState,
        payload: F,
    ) -> SchedResult<Workload>
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        self.workload().spawn_classified(state, payload)
    }

    /// Schedule a void payload addressed at a qdisc handle
    pub fn schedule_to<F>(&self, target: Handle, payload: F) -> SchedResult<Workload>
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        self.workload().to_handle(target).spawn(payload)
    }

    /// Schedule a result-returning payload and obtain its awaiter
    pub fn submit<T, F>(&self, payload: F) -> SchedResult<WorkloadHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(WorkloadContext) -> T + Send + 'static,
    {
        self.workload().submit(payload)
    }

    /// Schedule an asynchronously result-returning payload
    pub fn submit_async<F, Fut, T>(&self, payload: F) -> SchedResult<WorkloadHandle<T>>
    where
        F: FnOnce(WorkloadContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.workload().submit_async(payload)
    }

    /// Attach a terminal callback wrapped per the factory's context flags
    ///
    /// The callback runs inside the scheduling-time `tracing` span when
    /// execution-context flow is on, and is posted to the captured
    /// single-threaded context when one is configured. Without a captured
    /// context, a callback that completes on a worker thread is re-posted
    /// onto the ambient pool so the dispatch loop stays responsive.
    pub fn on_terminal<F>(&self, workload: &Workload, callback: F)
    where
        F: FnOnce(&Workload) + Send + 'static,
    {
        let mut continuation = Continuation::inline(callback);
        if self.flow_execution_context {
            continuation = continuation.span_scoped();
        }
        if let Some(context) = &self.captured_context {
            continuation = continuation.posted(context.clone());
        } else {
            let pool = self.pool.dispatcher();
            let inner = continuation;
            continuation = Continuation::inline(move |workload| {
                if super::worker::is_worker_thread() {
                    let workload = workload.clone();
                    pool.dispatch(Box::new(move || inner.run(&workload)));
                } else {
                    inner.run(workload);
                }
            });
        }
        workload.attach_continuation(continuation);
    }

    /// Complete the tree: every later enqueue fails with a scheduling error
    pub fn complete(&self) {
        self.root.complete();
    }

    fn enqueue_inner(
        &self,
        workload: Workload,
        state: Option<&dyn ClassifyState>,
        target: Option<Handle>,
    ) -> SchedResult<()> {
        let result = match target {
            None => self.root.enqueue(workload.clone(), state),
            Some(handle) if handle == self.root.handle() => {
                self.root.enqueue(workload.clone(), state)
            }
            Some(handle) => self.enqueue_routed(workload.clone(), state, handle),
        };
        if result.is_err() {
            // Settle the orphaned workload so token registrations and
            // continuations do not dangle.
            workload.request_cancellation();
        }
        result
    }

    fn enqueue_routed(
        &self,
        workload: Workload,
        state: Option<&dyn ClassifyState>,
        target: Handle,
    ) -> SchedResult<()> {
        let Some(classful) = &self.root_classful else {
            return Err(SchedError::NoRoute(target));
        };
        let mut path = RoutingPath::new();
        if !classful.try_find_route(target, &mut path) {
            return Err(SchedError::NoRoute(target));
        }
        for node in path.nodes() {
            node.qdisc.will_enqueue_from_routing_path(node, &workload);
        }
        match path.target() {
            Some(leaf) => leaf.enqueue(workload, state),
            None => Err(SchedError::NoRoute(target)),
        }
    }
}

impl std::fmt::Debug for WorkloadFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkloadFactory")
            .field("root", &self.root.handle())
            .field("max_concurrency", &self.pool.max_workers())
            .finish()
    }
}

/// Per-workload scheduling options
pub struct ScheduleBuilder<'a> {
    factory: &'a WorkloadFactory,
    token: Option<CancelToken>,
    due: Option<Instant>,
    target: Option<Handle>,
}

impl ScheduleBuilder<'_> {
    /// Observe a cancellation token
    pub fn with_token(mut self, token: &CancelToken) -> Self {
        self.token = Some(token.clone());
        self
    }

    /// Annotate with a due date relative to now (earliest-due-date trees)
    pub fn due_in(mut self, due_in: Duration) -> Self {
        self.due = Some(Instant::now() + due_in);
        self
    }

    /// Address a specific qdisc handle instead of classifying from the root
    pub fn to_handle(mut self, target: Handle) -> Self {
        self.target = Some(target);
        self
    }

    fn launch(
        self,
        payload: Payload,
        payload_id: crate::workload::PayloadId,
        state: Option<&dyn ClassifyState>,
    ) -> SchedResult<Workload> {
        let workload = Workload::new(payload, payload_id, self.due, self.factory.pooling);
        if let Some(token) = &self.token {
            workload.attach_token(token);
        }
        self.factory
            .enqueue_inner(workload.clone(), state, self.target)?;
        Ok(workload)
    }

    /// Schedule a void payload
    pub fn spawn<F>(self, payload: F) -> SchedResult<Workload>
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        let (payload, id) = Payload::unit(payload);
        self.launch(payload, id, None)
    }

    /// Schedule a void payload with classification state
    pub fn spawn_classified<F>(
        self,
        state: &dyn ClassifyState,
        payload: F,
    ) -> SchedResult<Workload>
    where
        F: FnOnce(WorkloadContext) + Send + 'static,
    {
        let (payload, id) = Payload::unit(payload);
        self.launch(payload, id, Some(state))
    }

    /// Schedule a result-returning payload and obtain its awaiter
    pub fn submit<T, F>(self, payload: F) -> SchedResult<WorkloadHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(WorkloadContext) -> T + Send + 'static,
    {
        let (payload, id) = Payload::value(payload);
        self.launch(payload, id, None).map(WorkloadHandle::new)
    }

    /// Schedule a result-returning payload with classification state
    pub fn submit_classified<T, F>(
        self,
        state: &dyn ClassifyState,
        payload: F,
    ) -> SchedResult<WorkloadHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce(WorkloadContext) -> T + Send + 'static,
    {
        let (payload, id) = Payload::value(payload);
        self.launch(payload, id, Some(state)).map(WorkloadHandle::new)
    }

    /// Schedule an asynchronously result-returning payload
    pub fn submit_async<F, Fut, T>(self, payload: F) -> SchedResult<WorkloadHandle<T>>
    where
        F: FnOnce(WorkloadContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (payload, id) = Payload::future(payload);
        self.launch(payload, id, None).map(WorkloadHandle::new)
    }
}
