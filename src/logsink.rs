//! Diagnostic log sink
//!
//! The scheduler consumes a single-method sink for structured events. The
//! default implementation forwards to `tracing`; tests that assert on emitted
//! events install their own sink.

use serde::{Deserialize, Serialize};

/// Kind of a recorded scheduler event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Internal diagnostics (verbose)
    Diagnostic,
    /// Recoverable anomalies, e.g. a displaced workload in a bounded ring
    Warning,
    /// Errors that were surfaced to a caller
    Error,
    /// Captured payload faults
    Exception,
    /// Lifecycle events (worker spawn/retire, qdisc completion)
    Event,
}

/// A sink for structured scheduler events
pub trait LogSink: Send + Sync {
    /// Record one event
    fn record(&self, kind: EventKind, message: &str);
}

/// Default sink: forwards events to `tracing` at matching levels
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, kind: EventKind, message: &str) {
        match kind {
            EventKind::Diagnostic => tracing::trace!(target: "schedtree", "{message}"),
            EventKind::Warning => tracing::warn!(target: "schedtree", "{message}"),
            EventKind::Error => tracing::error!(target: "schedtree", "{message}"),
            EventKind::Exception => tracing::error!(target: "schedtree", fault = true, "{message}"),
            EventKind::Event => tracing::debug!(target: "schedtree", "{message}"),
        }
    }
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn record(&self, _kind: EventKind, _message: &str) {}
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Test sink capturing every event in order
    #[derive(Default, Clone)]
    pub struct CapturingSink {
        events: Arc<Mutex<Vec<(EventKind, String)>>>,
    }

    impl CapturingSink {
        pub fn events(&self) -> Vec<(EventKind, String)> {
            self.events.lock().clone()
        }

        pub fn count(&self, kind: EventKind) -> usize {
            self.events.lock().iter().filter(|(k, _)| *k == kind).count()
        }
    }

    impl LogSink for CapturingSink {
        fn record(&self, kind: EventKind, message: &str) {
            self.events.lock().push((kind, message.to_string()));
        }
    }
}
