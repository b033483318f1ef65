//! Hierarchical QoS-aware workload scheduling
//!
//! This crate composes a tree of *queuing disciplines* (qdiscs) — classful
//! inner nodes and classless leaves — into a configurable, policy-driven
//! scheduler for short-lived units of work:
//! - Pluggable disciplines: FIFO, LIFO, bounded rings, strict priority,
//!   weighted fair queuing, earliest due date, and measurement wrappers
//! - A workload state machine with cooperative cancellation, continuations,
//!   and awaiter integration
//! - A cooperative worker pool drawn from an ambient thread pool, with
//!   dynamic spawn/retire and back-track semantics
//! - Lock-free hot paths built on atomics, a token bitmap, and a two-group
//!   reader/writer-style lock

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod builders;
pub mod error;
pub mod logsink;
pub mod pool;
pub mod qdisc;
pub mod sync;
pub mod vtime;
pub mod workload;

pub use builders::{QdiscTreeBuilder, WorkloadFactoryBuilder};
pub use error::{SchedError, SchedResult, WorkloadFailure};
pub use logsink::{EventKind, LogSink, NullSink, TracingSink};
pub use pool::{Dispatch, ThreadDispatch, TokioDispatch, WorkloadFactory};
pub use qdisc::{ClassfulQdisc, Handle, Qdisc};
pub use workload::{CancelToken, Workload, WorkloadHandle, WorkloadStatus};
