//! Typed awaiter over a workload
//!
//! `WorkloadHandle<T>` is ready exactly when its workload is terminal. While
//! pending it registers the polling task's waker; the terminal publication
//! wakes it before continuations drain. On resumption the handle returns the
//! published result or surfaces the stored failure.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::WorkloadFailure;

use super::{CompletionView, Continuation, Workload};

/// Awaitable, typed view of a scheduled workload
#[derive(Debug, Clone)]
pub struct WorkloadHandle<T> {
    workload: Workload,
    _result: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> WorkloadHandle<T> {
    pub(crate) fn new(workload: Workload) -> Self {
        Self {
            workload,
            _result: PhantomData,
        }
    }

    /// The underlying workload
    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    /// Whether the workload is terminal and the result is available
    pub fn is_ready(&self) -> bool {
        self.workload.status().is_terminal()
    }

    /// Attach a result-consuming continuation
    ///
    /// The callback observes the typed result exactly as an awaiter would;
    /// it runs inline immediately when the workload is already terminal.
    pub fn on_completed<F>(&self, f: F)
    where
        F: FnOnce(Result<T, WorkloadFailure>) + Send + 'static,
    {
        let workload = self.workload.clone();
        self.workload.attach_continuation(Continuation::inline(move |_| {
            f(take_typed::<T>(&workload));
        }));
    }

    /// Non-blocking result probe
    pub fn try_result(&self) -> Option<Result<T, WorkloadFailure>> {
        if self.is_ready() {
            Some(take_typed::<T>(&self.workload))
        } else {
            None
        }
    }

    /// Completion view without consuming the result
    pub fn completion(&self) -> CompletionView {
        self.workload.completion_view()
    }
}

fn take_typed<T: Send + 'static>(workload: &Workload) -> Result<T, WorkloadFailure> {
    let value = workload.take_terminal_outcome()?;
    match value.downcast::<T>() {
        Ok(boxed) => Ok(*boxed),
        // A handle is only ever constructed alongside its typed payload, so
        // a mismatch means the result was consumed through another view.
        Err(_) => Err(WorkloadFailure::Canceled),
    }
}

impl<T: Send + 'static> Future for WorkloadHandle<T> {
    type Output = Result<T, WorkloadFailure>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_ready() {
            return Poll::Ready(take_typed::<T>(&self.workload));
        }

        self.workload.register_waker(cx.waker());

        // Re-check: the workload may have gone terminal between the status
        // probe and the waker registration.
        if self.is_ready() {
            Poll::Ready(take_typed::<T>(&self.workload))
        } else {
            Poll::Pending
        }
    }
}
