//! Ambient thread-pool seam
//!
//! The scheduler requests execution through a single-method trait so it can
//! ride on a tokio runtime, plain OS threads, or anything an embedder wires
//! in. A companion trait models a user-supplied single-threaded context for
//! continuations that must run on a particular thread.

use std::sync::Arc;

/// A unit of pool work
pub type WorkItem = Box<dyn FnOnce() + Send>;

/// An ambient thread pool accepting background work items
pub trait Dispatch: Send + Sync {
    /// Run `item` on some background thread
    fn dispatch(&self, item: WorkItem);
}

/// Dispatcher backed by a tokio runtime's blocking pool
///
/// Worker loops block while executing payloads, so they ride on
/// `spawn_blocking` rather than the async scheduler.
#[derive(Clone)]
pub struct TokioDispatch {
    handle: tokio::runtime::Handle,
}

impl TokioDispatch {
    /// Use an explicit runtime handle
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Capture the current runtime
    ///
    /// Panics outside a runtime context, exactly like
    /// `tokio::runtime::Handle::current`.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Dispatch for TokioDispatch {
    fn dispatch(&self, item: WorkItem) {
        self.handle.spawn_blocking(item);
    }
}

impl std::fmt::Debug for TokioDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioDispatch").finish()
    }
}

/// Dispatcher spawning a fresh OS thread per work item
///
/// Worker counts are already bounded by the pool's concurrency limit, so the
/// thread-per-item cost stays bounded too.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDispatch;

impl Dispatch for ThreadDispatch {
    fn dispatch(&self, item: WorkItem) {
        std::thread::spawn(item);
    }
}

/// A single-threaded execution context continuations can be posted to
pub trait SingleThreadContext: Send + Sync {
    /// Queue `callback` onto the context's thread
    fn post(&self, callback: WorkItem);
}

impl<T: SingleThreadContext + ?Sized> SingleThreadContext for Arc<T> {
    fn post(&self, callback: WorkItem) {
        (**self).post(callback);
    }
}
