//! Workload entity and lifecycle
//!
//! A workload is a unit of deferred work: an opaque payload plus an atomic
//! status machine, an optional cancellation observer, a back-reference to the
//! leaf qdisc that currently owns it, and an ordered continuation list.
//! Ownership flows producer → leaf → worker; the entity itself is shared
//! behind an `Arc` and every stage holds one reference.

pub mod awaiter;
pub mod cancel;
pub mod continuation;
pub mod payload;
pub mod status;

pub use awaiter::WorkloadHandle;
pub use cancel::{CallbackHandle, CancelToken};
pub use continuation::Continuation;
pub use payload::PayloadId;
pub use status::WorkloadStatus;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Waker;
use std::time::Instant;

use futures::task::AtomicWaker;
use parking_lot::Mutex;

use crate::error::{PayloadFault, SchedError, SchedResult, WorkloadFailure};
use crate::qdisc::Qdisc;

use continuation::ContinuationList;
use payload::{BoxedValue, Payload};
use status::AtomicStatus;

/// Arrival order stamp, shared across all trees in the process
static ARRIVAL_SEQ: AtomicU64 = AtomicU64::new(1);

/// Outcome of a dequeue-side status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueDecision {
    /// The workload transitioned to `Running`; execute it
    Run,
    /// A pending cancellation was honored; the workload is now `Canceled`
    AlreadyCanceled,
    /// The workload was already terminal or otherwise unusable
    Stale,
}

/// Snapshot of a terminal workload for outcome-consuming observers
#[derive(Debug, Clone)]
pub struct CompletionView {
    /// Status at observation time
    pub status: WorkloadStatus,
    /// The failure, when the workload did not complete successfully
    pub failure: Option<WorkloadFailure>,
}

/// Cooperative-cancellation view handed to executing payloads
#[derive(Debug, Clone)]
pub struct WorkloadContext {
    workload: Workload,
}

impl WorkloadContext {
    /// Whether cancellation has been requested for this workload
    pub fn is_cancellation_requested(&self) -> bool {
        self.workload.is_cancellation_requested()
    }

    /// Acknowledge a cancellation request
    ///
    /// The payload should return promptly afterwards; the workload then
    /// finishes as `Canceled` instead of `RanToCompletion`. Calling this
    /// without a pending request has no effect.
    pub fn acknowledge_cancellation(&self) {
        self.workload.inner.abort_ack.store(true, Ordering::Release);
    }

    /// Identity of the executing payload
    pub fn payload_id(&self) -> PayloadId {
        self.workload.payload_id()
    }
}

enum OutcomeCell {
    Success(BoxedValue),
    Fault(PayloadFault),
    Canceled,
}

pub(crate) struct WorkloadInner {
    status: AtomicStatus,
    payload: Mutex<Option<Payload>>,
    payload_id: PayloadId,
    bound: Mutex<Option<Weak<dyn Qdisc>>>,
    outcome: Mutex<Option<OutcomeCell>>,
    continuations: ContinuationList,
    waker: AtomicWaker,
    due: Option<Instant>,
    seq: AtomicU64,
    abort_ack: AtomicBool,
    cancel_reg: Mutex<Option<(CancelToken, CallbackHandle)>>,
}

/// A unit of deferred work
#[derive(Clone)]
pub struct Workload {
    inner: Arc<WorkloadInner>,
}

impl Workload {
    pub(crate) fn new(
        payload: Payload,
        payload_id: PayloadId,
        due: Option<Instant>,
        pooled: bool,
    ) -> Self {
        Self {
            inner: Arc::new(WorkloadInner {
                status: AtomicStatus::new(),
                payload: Mutex::new(Some(payload)),
                payload_id,
                bound: Mutex::new(None),
                outcome: Mutex::new(None),
                continuations: ContinuationList::new(pooled),
                waker: AtomicWaker::new(),
                due,
                seq: AtomicU64::new(0),
                abort_ack: AtomicBool::new(false),
                cancel_reg: Mutex::new(None),
            }),
        }
    }

    /// Current base status
    pub fn status(&self) -> WorkloadStatus {
        self.inner.status.load()
    }

    /// Identity key of the payload
    pub fn payload_id(&self) -> PayloadId {
        self.inner.payload_id
    }

    /// Due-date annotation, if any
    pub fn due_date(&self) -> Option<Instant> {
        self.inner.due
    }

    /// Arrival order stamp; zero before the first bind
    pub fn arrival_seq(&self) -> u64 {
        self.inner.seq.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same workload
    pub fn same_as(&self, other: &Workload) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The leaf currently owning this workload, if any
    pub fn bound_leaf(&self) -> Option<Arc<dyn Qdisc>> {
        self.inner.bound.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Observe the cancellation state (requested or advisory hint)
    pub fn is_cancellation_requested(&self) -> bool {
        self.status() == WorkloadStatus::CancellationRequested || self.inner.status.cancel_hint()
    }

    /// Wire a cancellation token to this workload
    pub(crate) fn attach_token(&self, token: &CancelToken) {
        let observer = self.clone();
        let handle = token.register(move || {
            observer.request_cancellation();
        });
        *self.inner.cancel_reg.lock() = Some((token.clone(), handle));
    }

    /// Bind to a leaf: CAS `Created → Scheduled` and publish the
    /// back-reference
    ///
    /// Refused when the workload is already bound or terminal; the leaf must
    /// then reject the enqueue.
    pub(crate) fn bind(&self, leaf: &Arc<dyn Qdisc>) -> SchedResult<()> {
        let mut bound = self.inner.bound.lock();
        if !self
            .inner
            .status
            .try_transition(WorkloadStatus::Created, WorkloadStatus::Scheduled)
        {
            return Err(SchedError::AlreadyScheduled);
        }
        *bound = Some(Arc::downgrade(leaf));
        self.inner
            .seq
            .store(ARRIVAL_SEQ.fetch_add(1, Ordering::Relaxed), Ordering::Release);
        Ok(())
    }

    fn clear_bound(&self) {
        self.inner.bound.lock().take();
    }

    /// Dequeue-side transition: `Scheduled → Running`, unbinding in the same
    /// step, or honor a pending cancellation
    pub(crate) fn begin_dequeue(&self) -> DequeueDecision {
        loop {
            match self.status() {
                WorkloadStatus::Scheduled => {
                    if self
                        .inner
                        .status
                        .try_transition(WorkloadStatus::Scheduled, WorkloadStatus::Running)
                    {
                        self.clear_bound();
                        return DequeueDecision::Run;
                    }
                }
                WorkloadStatus::CancellationRequested => {
                    if self.inner.status.try_transition(
                        WorkloadStatus::CancellationRequested,
                        WorkloadStatus::Canceled,
                    ) {
                        self.clear_bound();
                        self.publish_canceled();
                        return DequeueDecision::AlreadyCanceled;
                    }
                }
                _ => return DequeueDecision::Stale,
            }
        }
    }

    /// Request cooperative cancellation
    ///
    /// Never interrupts an executing payload. Returns `true` when the request
    /// changed the workload's fate: terminal and already-requested states
    /// report `false`.
    pub fn request_cancellation(&self) -> bool {
        loop {
            match self.status() {
                WorkloadStatus::Created => {
                    if self
                        .inner
                        .status
                        .try_transition(WorkloadStatus::Created, WorkloadStatus::Canceled)
                    {
                        self.publish_canceled();
                        return true;
                    }
                }
                WorkloadStatus::Scheduled => {
                    if self.inner.status.try_transition(
                        WorkloadStatus::Scheduled,
                        WorkloadStatus::CancellationRequested,
                    ) {
                        self.try_unschedule();
                        return true;
                    }
                }
                WorkloadStatus::Running => return self.inner.status.try_set_cancel_hint(),
                WorkloadStatus::CancellationRequested
                | WorkloadStatus::AsyncSuccess
                | WorkloadStatus::RanToCompletion
                | WorkloadStatus::Faulted
                | WorkloadStatus::Canceled => return false,
            }
        }
    }

    /// Best-effort removal from the owning leaf after a cancellation request
    fn try_unschedule(&self) {
        let Some(leaf) = self.bound_leaf() else { return };
        if leaf.try_remove(self)
            && self
                .inner
                .status
                .try_transition(WorkloadStatus::CancellationRequested, WorkloadStatus::Canceled)
        {
            self.clear_bound();
            self.publish_canceled();
        }
    }

    /// Cancel a workload displaced from a constrained ring
    ///
    /// The ring has already removed it from storage, so the dequeue edge is
    /// taken directly to `Canceled`.
    pub(crate) fn cancel_displaced(&self) -> bool {
        if self
            .inner
            .status
            .try_transition_from_any(
                &[
                    WorkloadStatus::Scheduled,
                    WorkloadStatus::CancellationRequested,
                ],
                WorkloadStatus::Canceled,
            )
            .is_some()
        {
            self.clear_bound();
            self.publish_canceled();
            true
        } else {
            false
        }
    }

    /// Execute the payload on the calling worker thread
    ///
    /// Drives the full terminal protocol: catch panics into `Faulted`, honor
    /// acknowledged cancellation as `Canceled`, pass async payloads through
    /// `AsyncSuccess`, then publish the outcome and drain continuations.
    pub(crate) fn execute(&self) {
        debug_assert_eq!(self.status(), WorkloadStatus::Running);

        let Some(payload) = self.inner.payload.lock().take() else {
            self.complete_fault(PayloadFault {
                payload: self.payload_id(),
                message: "payload invoked twice".to_string(),
            });
            return;
        };

        let ctx = WorkloadContext {
            workload: self.clone(),
        };
        let result = catch_unwind(AssertUnwindSafe(|| match payload {
            Payload::Unit(f) => {
                f(ctx);
                None
            }
            Payload::Value(f) => Some(f(ctx)),
            Payload::Future(f) => {
                let value = futures::executor::block_on(f(ctx));
                // Transient marker: completion happened, publication has not.
                self.inner
                    .status
                    .try_transition(WorkloadStatus::Running, WorkloadStatus::AsyncSuccess);
                Some(value)
            }
        }));

        match result {
            Ok(value) => {
                let aborted = self.inner.abort_ack.load(Ordering::Acquire)
                    && self.inner.status.cancel_hint();
                if aborted {
                    self.complete_canceled();
                } else {
                    self.complete_ok(value.unwrap_or_else(|| Box::new(())));
                }
            }
            Err(panic) => {
                self.complete_fault(PayloadFault {
                    payload: self.payload_id(),
                    message: panic_message(panic.as_ref()),
                });
            }
        }
    }

    fn complete_ok(&self, value: BoxedValue) {
        *self.inner.outcome.lock() = Some(OutcomeCell::Success(value));
        if self
            .inner
            .status
            .try_transition_from_any(
                &[WorkloadStatus::Running, WorkloadStatus::AsyncSuccess],
                WorkloadStatus::RanToCompletion,
            )
            .is_some()
        {
            self.finalize();
        }
    }

    fn complete_fault(&self, fault: PayloadFault) {
        *self.inner.outcome.lock() = Some(OutcomeCell::Fault(fault));
        if self
            .inner
            .status
            .try_transition_from_any(
                &[WorkloadStatus::Running, WorkloadStatus::AsyncSuccess],
                WorkloadStatus::Faulted,
            )
            .is_some()
        {
            self.finalize();
        }
    }

    fn complete_canceled(&self) {
        if self
            .inner
            .status
            .try_transition(WorkloadStatus::Running, WorkloadStatus::Canceled)
        {
            self.publish_canceled();
        }
    }

    /// Publish the canceled outcome for a workload whose status is already
    /// `Canceled`
    fn publish_canceled(&self) {
        {
            let mut outcome = self.inner.outcome.lock();
            if outcome.is_none() {
                *outcome = Some(OutcomeCell::Canceled);
            }
        }
        self.finalize();
    }

    /// One-shot terminal epilogue: wake the awaiter, detach the token, drain
    /// continuations in registration order
    fn finalize(&self) {
        if !self.inner.status.try_claim_continuations() {
            return;
        }
        if let Some((token, handle)) = self.inner.cancel_reg.lock().take() {
            token.unregister(handle);
        }
        self.inner.waker.wake();
        self.inner.continuations.drain(self);
    }

    /// Attach a continuation; runs inline when already terminal
    pub fn attach_continuation(&self, continuation: Continuation) {
        self.inner.continuations.attach(continuation, self);
    }

    /// Attach a continuation at the head of the list
    pub(crate) fn attach_continuation_first(&self, continuation: Continuation) {
        self.inner.continuations.attach_first(continuation, self);
    }

    /// Register the awaiting task's waker
    pub(crate) fn register_waker(&self, waker: &Waker) {
        self.inner.waker.register(waker);
    }

    /// Completion snapshot; failure is `None` for success or non-terminal
    pub fn completion_view(&self) -> CompletionView {
        let status = self.status();
        let failure = match status {
            WorkloadStatus::Faulted => self.inner.outcome.lock().as_ref().and_then(|o| match o {
                OutcomeCell::Fault(fault) => Some(WorkloadFailure::Faulted(fault.clone())),
                _ => None,
            }),
            WorkloadStatus::Canceled => Some(WorkloadFailure::Canceled),
            _ => None,
        };
        CompletionView { status, failure }
    }

    /// Take the terminal result value; the success value can be consumed once
    pub(crate) fn take_terminal_outcome(&self) -> Result<BoxedValue, WorkloadFailure> {
        let mut outcome = self.inner.outcome.lock();
        match outcome.take() {
            Some(OutcomeCell::Success(value)) => Ok(value),
            Some(OutcomeCell::Fault(fault)) => {
                let failure = WorkloadFailure::Faulted(fault.clone());
                *outcome = Some(OutcomeCell::Fault(fault));
                Err(failure)
            }
            Some(OutcomeCell::Canceled) => {
                *outcome = Some(OutcomeCell::Canceled);
                Err(WorkloadFailure::Canceled)
            }
            None => Err(WorkloadFailure::Canceled),
        }
    }
}

impl std::fmt::Debug for Workload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workload")
            .field("status", &self.status())
            .field("payload", &self.inner.payload_id)
            .field("seq", &self.arrival_seq())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "payload panicked".to_string()
    }
}
