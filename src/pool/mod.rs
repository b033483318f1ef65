//! Worker pool, dispatcher, and workload factory
//!
//! The scheduler owns no OS threads: worker loops are posted onto an ambient
//! thread pool through the [`Dispatch`] seam and retire themselves when the
//! tree runs dry. The factory is the producer-facing surface binding a root
//! qdisc to a configured pool.

pub mod dispatch;
pub mod factory;
pub mod provider;
pub mod worker;

pub use dispatch::{Dispatch, SingleThreadContext, ThreadDispatch, TokioDispatch, WorkItem};
pub use factory::{ScheduleBuilder, WorkloadFactory};
pub use provider::{MapServiceProvider, ServiceProviderFactory, WorkerScope};
pub use worker::is_worker_thread;
