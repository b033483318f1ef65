//! Constrained LIFO overflow: the displaced workload cancels with a warning

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use schedtree::qdisc::PrioritizationPolicy;
use schedtree::{EventKind, QdiscTreeBuilder, WorkloadFactoryBuilder, WorkloadStatus};

#[test]
fn overflow_displaces_oldest_and_records_warning() {
    let sink = common::CapturingSink::default();
    let gate = common::GatedDispatch::new();
    let factory = WorkloadFactoryBuilder::new()
        .max_concurrency(1)
        .dispatch(Arc::new(gate.clone()))
        .log_sink(Arc::new(sink.clone()))
        .root_tree(QdiscTreeBuilder::constrained_lifo(
            1,
            3,
            PrioritizationPolicy::MinimizeSchedulingDelay,
        ))
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    // Enqueue A, B, C, D without draining: the gate parks the worker.
    let ran = Arc::new(Mutex::new(Vec::new()));
    let mut workloads = Vec::new();
    for tag in ["A", "B", "C", "D"] {
        let ran = ran.clone();
        let scheduled = factory.schedule(move |_ctx| {
            ran.lock().push(tag);
        });
        match scheduled {
            Ok(workload) => workloads.push(workload),
            Err(err) => panic!("enqueue failed: {err}"),
        }
    }

    // Capacity 3: D displaced the oldest (A) exactly once.
    assert_eq!(workloads[0].status(), WorkloadStatus::Canceled);
    assert_eq!(sink.count(EventKind::Warning), 1);

    // Start the pool; the LIFO drains newest-first.
    gate.release();
    assert!(common::wait_until(Duration::from_secs(2), || workloads
        .iter()
        .all(|w| w.status().is_terminal())));

    assert_eq!(*ran.lock(), vec!["D", "C", "B"]);
    for survivor in &workloads[1..] {
        assert_eq!(survivor.status(), WorkloadStatus::RanToCompletion);
    }
}
