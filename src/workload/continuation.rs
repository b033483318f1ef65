//! Continuations
//!
//! Continuations are first-class objects carried by a workload and invoked
//! exactly once, in registration order, after the workload reaches a terminal
//! status. They compose by wrapping: an execution-context capture around a
//! thread-pool dispatch around a synchronization-context post around the user
//! callback. Attaching a continuation to an already-terminal workload runs it
//! inline immediately.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::{Dispatch, SingleThreadContext};
use crate::vtime::MeasurementProbe;

use super::{CompletionView, Workload};

/// A continuation attached to a workload
pub enum Continuation {
    /// Run on the completing thread
    Inline(Box<dyn FnOnce(&Workload) + Send>),
    /// Consume the completion outcome on the completing thread
    OnOutcome(Box<dyn FnOnce(CompletionView) + Send>),
    /// Dispatch the inner continuation onto an ambient thread pool
    Dispatched {
        /// Pool the inner continuation is posted to
        pool: Arc<dyn Dispatch>,
        /// Wrapped continuation
        inner: Box<Continuation>,
    },
    /// Run the inner continuation inside a captured `tracing` span, carrying
    /// the scheduling-time execution context across the boundary
    SpanScoped {
        /// Span captured at attach time
        span: tracing::Span,
        /// Wrapped continuation
        inner: Box<Continuation>,
    },
    /// Post the inner continuation onto a user-supplied single-threaded
    /// context
    Posted {
        /// Target context
        context: Arc<dyn SingleThreadContext>,
        /// Wrapped continuation
        inner: Box<Continuation>,
    },
    /// Record an execution-time sample into a virtual-time table
    Measure(Box<MeasurementProbe>),
}

impl Continuation {
    /// Plain callback continuation
    pub fn inline<F>(f: F) -> Self
    where
        F: FnOnce(&Workload) + Send + 'static,
    {
        Continuation::Inline(Box::new(f))
    }

    /// Outcome-consuming continuation
    pub fn on_outcome<F>(f: F) -> Self
    where
        F: FnOnce(CompletionView) + Send + 'static,
    {
        Continuation::OnOutcome(Box::new(f))
    }

    /// Wrap in a thread-pool dispatch
    pub fn dispatched(self, pool: Arc<dyn Dispatch>) -> Self {
        Continuation::Dispatched {
            pool,
            inner: Box::new(self),
        }
    }

    /// Wrap in the current `tracing` span
    pub fn span_scoped(self) -> Self {
        Continuation::SpanScoped {
            span: tracing::Span::current(),
            inner: Box::new(self),
        }
    }

    /// Wrap in a single-threaded context post
    pub fn posted(self, context: Arc<dyn SingleThreadContext>) -> Self {
        Continuation::Posted {
            context,
            inner: Box::new(self),
        }
    }

    /// Invoke the continuation for `workload`
    pub(crate) fn run(self, workload: &Workload) {
        match self {
            Continuation::Inline(f) => f(workload),
            Continuation::OnOutcome(f) => f(workload.completion_view()),
            Continuation::Dispatched { pool, inner } => {
                let workload = workload.clone();
                pool.dispatch(Box::new(move || inner.run(&workload)));
            }
            Continuation::SpanScoped { span, inner } => {
                let _entered = span.enter();
                inner.run(workload);
            }
            Continuation::Posted { context, inner } => {
                let workload = workload.clone();
                context.post(Box::new(move || inner.run(&workload)));
            }
            Continuation::Measure(probe) => probe.complete(workload),
        }
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Continuation::Inline(_) => "Inline",
            Continuation::OnOutcome(_) => "OnOutcome",
            Continuation::Dispatched { .. } => "Dispatched",
            Continuation::SpanScoped { .. } => "SpanScoped",
            Continuation::Posted { .. } => "Posted",
            Continuation::Measure(_) => "Measure",
        };
        f.debug_tuple("Continuation").field(&kind).finish()
    }
}

const POOLED_BUFFER_CAPACITY: usize = 4;
const POOL_RETAIN: usize = 16;

thread_local! {
    static BUFFER_POOL: RefCell<Vec<Vec<Continuation>>> = const { RefCell::new(Vec::new()) };
}

/// Rent a continuation buffer from the thread-local pool
pub(crate) fn rent_buffer() -> Vec<Continuation> {
    BUFFER_POOL.with(|pool| {
        pool.borrow_mut()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(POOLED_BUFFER_CAPACITY))
    })
}

/// Return a drained buffer to the thread-local pool
pub(crate) fn recycle_buffer(mut buffer: Vec<Continuation>) {
    buffer.clear();
    BUFFER_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < POOL_RETAIN {
            pool.push(buffer);
        }
    });
}

enum Slot {
    Open(Vec<Continuation>),
    Drained,
}

/// Ordered, fire-exactly-once continuation storage
pub(crate) struct ContinuationList {
    slot: Mutex<Slot>,
    pooled: bool,
}

impl ContinuationList {
    pub(crate) fn new(pooled: bool) -> Self {
        let buffer = if pooled { rent_buffer() } else { Vec::new() };
        Self {
            slot: Mutex::new(Slot::Open(buffer)),
            pooled,
        }
    }

    /// Attach a continuation, running it inline when the list has already
    /// drained
    pub(crate) fn attach(&self, continuation: Continuation, workload: &Workload) {
        self.insert(continuation, workload, false);
    }

    /// Attach at the head of the list (measurement probes run first)
    pub(crate) fn attach_first(&self, continuation: Continuation, workload: &Workload) {
        self.insert(continuation, workload, true);
    }

    fn insert(&self, continuation: Continuation, workload: &Workload, first: bool) {
        let inline = {
            let mut slot = self.slot.lock();
            match &mut *slot {
                Slot::Open(buffer) => {
                    if first {
                        buffer.insert(0, continuation);
                    } else {
                        buffer.push(continuation);
                    }
                    None
                }
                Slot::Drained => Some(continuation),
            }
        };
        if let Some(continuation) = inline {
            continuation.run(workload);
        }
    }

    /// Drain and invoke all continuations in registration order
    ///
    /// The caller must hold the one-shot claim on the workload status; this
    /// method itself is idempotent only through that claim.
    pub(crate) fn drain(&self, workload: &Workload) {
        let drained = {
            let mut slot = self.slot.lock();
            std::mem::replace(&mut *slot, Slot::Drained)
        };
        if let Slot::Open(mut buffer) = drained {
            for continuation in buffer.drain(..) {
                continuation.run(workload);
            }
            if self.pooled {
                recycle_buffer(buffer);
            }
        }
    }
}

impl std::fmt::Debug for ContinuationList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuationList")
            .field("pooled", &self.pooled)
            .finish()
    }
}
