//! Error types for the scheduling tree
//!
//! Two families of caller-visible errors: scheduling errors (rejected
//! operations against the tree) and lifecycle errors (caller misuse of
//! primitives). Workload outcomes use a separate typed failure surface so
//! awaiters and continuations can distinguish faults from cancellation.

use thiserror::Error;

use crate::qdisc::Handle;
use crate::workload::PayloadId;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by tree construction, enqueue, and primitive misuse
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// A handle with the unsigned default value was supplied
    #[error("handle 0 is reserved; choose a non-default handle")]
    DefaultHandle,

    /// Two qdiscs in one tree share a handle
    #[error("duplicate handle {0} in scheduling tree")]
    DuplicateHandle(Handle),

    /// No qdisc with the requested handle exists under the root
    #[error("no route to handle {0}")]
    NoRoute(Handle),

    /// Enqueue attempted against a qdisc that has no parent yet
    #[error("qdisc {0} is not part of a scheduling tree yet")]
    NotInitialized(Handle),

    /// Enqueue attempted against a completed qdisc
    #[error("qdisc {0} has completed and no longer accepts workloads")]
    Completed(Handle),

    /// A workload was already bound to a leaf or is terminal
    #[error("workload is already scheduled or terminal")]
    AlreadyScheduled,

    /// Ring capacity outside [1, 65535]
    #[error("constrained queue capacity {0} outside [1, 65535]")]
    InvalidCapacity(usize),

    /// Priority band count outside [2, 56]
    #[error("priority band count {0} outside [2, 56]")]
    InvalidBandCount(usize),

    /// Fair-queuing weight of zero
    #[error("fair child weight must be positive")]
    InvalidWeight,

    /// Bitmap bit index beyond the 56 data bits
    #[error("bit index {0} beyond bitmap width 56")]
    BitOutOfRange(usize),

    /// A qdisc was initialized twice
    #[error("qdisc {0} initialized twice")]
    AlreadyInitialized(Handle),

    /// The same thread tried to re-enter a group lock
    #[error("recursive group lock acquisition on the same thread")]
    RecursiveLockAcquisition,

    /// The same thread tried to enter the opposite group of a held lock
    #[error("cross-group lock upgrade is not supported")]
    CrossGroupUpgrade,

    /// A qdisc advertised work it could not produce
    #[error("qdisc {0} violated an internal invariant: {1}")]
    InvariantViolation(Handle, String),
}

impl SchedError {
    /// Whether this error indicates caller misuse rather than a rejected operation
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            SchedError::AlreadyInitialized(_)
                | SchedError::RecursiveLockAcquisition
                | SchedError::CrossGroupUpgrade
        )
    }
}

/// A captured payload fault
///
/// Panics raised by a payload are caught at the execution boundary and
/// captured here; the scheduler never re-raises them.
#[derive(Error, Debug, Clone)]
#[error("payload {payload:?} faulted: {message}")]
pub struct PayloadFault {
    /// Identity of the faulting payload
    pub payload: PayloadId,
    /// Panic message, if one could be extracted
    pub message: String,
}

/// Failure surface seen by awaiters and result continuations
#[derive(Error, Debug, Clone)]
pub enum WorkloadFailure {
    /// The payload panicked; the fault is captured, not re-raised
    #[error(transparent)]
    Faulted(#[from] PayloadFault),

    /// The workload was canceled before or instead of completing
    #[error("workload canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_classification() {
        assert!(SchedError::RecursiveLockAcquisition.is_lifecycle());
        assert!(SchedError::CrossGroupUpgrade.is_lifecycle());
        assert!(SchedError::AlreadyInitialized(7).is_lifecycle());
        assert!(!SchedError::DefaultHandle.is_lifecycle());
        assert!(!SchedError::Completed(3).is_lifecycle());
    }

    #[test]
    fn test_error_display() {
        let err = SchedError::DuplicateHandle(42);
        assert_eq!(err.to_string(), "duplicate handle 42 in scheduling tree");
    }
}
