//! Shared helpers for the end-to-end scheduler tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use schedtree::pool::WorkItem;
use schedtree::{Dispatch, EventKind, LogSink};

/// Sink capturing every recorded event in order
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

/// Dispatcher that parks work items until the test releases them
///
/// Lets a test enqueue workloads "without draining": the pool believes its
/// workers are dispatched, but nothing runs until `release()`.
#[derive(Default, Clone)]
pub struct GatedDispatch {
    parked: Arc<Mutex<Vec<WorkItem>>>,
    open: Arc<Mutex<bool>>,
}

impl GatedDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every parked work item on its own thread; later dispatches run
    /// immediately
    pub fn release(&self) {
        *self.open.lock() = true;
        let parked = std::mem::take(&mut *self.parked.lock());
        for item in parked {
            std::thread::spawn(item);
        }
    }
}

impl Dispatch for GatedDispatch {
    fn dispatch(&self, item: WorkItem) {
        if *self.open.lock() {
            std::thread::spawn(item);
        } else {
            self.parked.lock().push(item);
        }
    }
}

/// Route scheduler diagnostics to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Poll `done` until it holds or `deadline` elapses
pub fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    done()
}
