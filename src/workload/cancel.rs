//! Cancellation tokens
//!
//! A clonable token observed by workloads for cooperative cancellation.
//! Tokens form a hierarchy: cancelling a parent cancels every child token.
//! Observers register callbacks that fire exactly once on cancellation;
//! callbacks registered after the fact run inline immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to a registered cancellation callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle(u64);

/// A token for cooperative workload cancellation
///
/// The token can be cloned and shared across threads; all clones observe the
/// same cancellation state.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    parent: Option<CancelToken>,
    children: Mutex<Vec<CancelToken>>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<CancelToken>) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                parent,
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a child token
    ///
    /// When the parent is cancelled, all children are cancelled as well.
    pub fn child_token(&self) -> Self {
        let child = Self::with_parent(Some(self.clone()));
        if self.is_cancelled() {
            child.cancel();
        } else {
            self.inner.children.lock().push(child.clone());
        }
        child
    }

    /// Whether this token or any ancestor has been cancelled
    pub fn is_cancelled(&self) -> bool {
        if self.inner.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match &self.inner.parent {
            Some(parent) => parent.is_cancelled(),
            None => false,
        }
    }

    /// Cancel this token, run registered callbacks, and cancel children
    pub fn cancel(&self) {
        let drained = {
            let mut callbacks = self.inner.callbacks.lock();
            if self.inner.cancelled.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *callbacks)
        };
        for (_, callback) in drained {
            callback();
        }

        let children = std::mem::take(&mut *self.inner.children.lock());
        for child in children {
            child.cancel();
        }
    }

    /// Register a callback to run on cancellation
    ///
    /// Runs inline immediately when the token is already cancelled.
    pub fn register<F>(&self, callback: F) -> CallbackHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return CallbackHandle(id);
            }
        }
        callback();
        CallbackHandle(id)
    }

    /// Remove a registered callback; returns whether it was still pending
    pub fn unregister(&self, handle: CallbackHandle) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != handle.0);
        callbacks.len() != before
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
