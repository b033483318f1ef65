//! Workload status machine
//!
//! A 32-bit atomic word holds the base status in the low byte and transient
//! flags above it. All transitions go through CAS along the permitted edges:
//!
//! ```text
//! Created ──schedule──▶ Scheduled ──dequeue──▶ Running ──▶ RanToCompletion
//!                          │                     │     ├──▶ Faulted
//!                    cancel│                     │     └──▶ Canceled
//!                          ▼                     ▼
//!              CancellationRequested ──dequeue──▶ Canceled
//! ```
//!
//! `AsyncSuccess` is a transient marker between an async payload's completion
//! and outcome publication; observers treat it as "not yet terminal".
//! Terminal statuses are sticky: once entered, only flag bits may change.

use std::sync::atomic::{AtomicU32, Ordering};

/// Base status of a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum WorkloadStatus {
    /// Constructed, not yet owned by any leaf
    Created = 0,
    /// Bound to a leaf qdisc, waiting for a worker
    Scheduled = 1,
    /// Executing on a worker
    Running = 2,
    /// Terminal: payload returned normally
    RanToCompletion = 3,
    /// Terminal: payload panicked
    Faulted = 4,
    /// Terminal: canceled before or instead of completion
    Canceled = 5,
    /// Cancellation observed while scheduled; honored at dequeue
    CancellationRequested = 6,
    /// Async payload finished; outcome publication pending
    AsyncSuccess = 7,
}

impl WorkloadStatus {
    /// Whether this status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkloadStatus::RanToCompletion | WorkloadStatus::Faulted | WorkloadStatus::Canceled
        )
    }

    fn from_bits(bits: u32) -> Self {
        match bits & STATUS_MASK {
            0 => WorkloadStatus::Created,
            1 => WorkloadStatus::Scheduled,
            2 => WorkloadStatus::Running,
            3 => WorkloadStatus::RanToCompletion,
            4 => WorkloadStatus::Faulted,
            5 => WorkloadStatus::Canceled,
            6 => WorkloadStatus::CancellationRequested,
            _ => WorkloadStatus::AsyncSuccess,
        }
    }
}

const STATUS_MASK: u32 = 0xFF;

/// Cancellation was requested while the payload runs; advisory only
pub(crate) const FLAG_CANCEL_HINT: u32 = 1 << 8;
/// Continuations have been claimed by exactly one finalizer
pub(crate) const FLAG_CONTINUATIONS_CLAIMED: u32 = 1 << 9;

/// Atomic wrapper enforcing the permitted transition edges
#[derive(Debug)]
pub(crate) struct AtomicStatus {
    bits: AtomicU32,
}

impl AtomicStatus {
    pub(crate) fn new() -> Self {
        Self {
            bits: AtomicU32::new(WorkloadStatus::Created as u32),
        }
    }

    /// Current base status
    pub(crate) fn load(&self) -> WorkloadStatus {
        WorkloadStatus::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Whether the advisory cancel hint is set
    pub(crate) fn cancel_hint(&self) -> bool {
        self.bits.load(Ordering::Acquire) & FLAG_CANCEL_HINT != 0
    }

    /// CAS one permitted edge, preserving flag bits
    ///
    /// Returns `true` when this call performed the transition.
    pub(crate) fn try_transition(&self, from: WorkloadStatus, to: WorkloadStatus) -> bool {
        debug_assert!(!from.is_terminal(), "terminal statuses are sticky");
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            if WorkloadStatus::from_bits(current) != from {
                return false;
            }
            let next = (current & !STATUS_MASK) | to as u32;
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// CAS from any of `from` to `to`; returns the matched source on success
    pub(crate) fn try_transition_from_any(
        &self,
        from: &[WorkloadStatus],
        to: WorkloadStatus,
    ) -> Option<WorkloadStatus> {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            let base = WorkloadStatus::from_bits(current);
            if !from.contains(&base) {
                return None;
            }
            let next = (current & !STATUS_MASK) | to as u32;
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(base),
                Err(actual) => current = actual,
            }
        }
    }

    /// Set the advisory cancel hint while the base status is `Running`
    ///
    /// Returns `false` when the workload left `Running` first; a successful
    /// completion wins over a stale cancellation request.
    pub(crate) fn try_set_cancel_hint(&self) -> bool {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            if WorkloadStatus::from_bits(current) != WorkloadStatus::Running {
                return false;
            }
            let next = current | FLAG_CANCEL_HINT;
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim the one-shot right to run continuations; valid only once the
    /// base status is terminal
    pub(crate) fn try_claim_continuations(&self) -> bool {
        let mut current = self.bits.load(Ordering::Relaxed);
        loop {
            if !WorkloadStatus::from_bits(current).is_terminal()
                || current & FLAG_CONTINUATIONS_CLAIMED != 0
            {
                return false;
            }
            let next = current | FLAG_CONTINUATIONS_CLAIMED;
            match self.bits.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}
