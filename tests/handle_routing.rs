//! Handle-addressed enqueue through the routing path

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use schedtree::error::SchedError;
use schedtree::{QdiscTreeBuilder, WorkloadFactoryBuilder};

#[test]
fn target_handle_bypasses_classification() {
    let gate = common::GatedDispatch::new();
    let tree = QdiscTreeBuilder::round_robin(1)
        .child(QdiscTreeBuilder::fifo(2))
        .child(QdiscTreeBuilder::fifo(3));
    let factory = WorkloadFactoryBuilder::new()
        .max_concurrency(1)
        .dispatch(Arc::new(gate.clone()))
        .root_tree(tree)
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    let ran = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let ran = ran.clone();
        let scheduled = factory.schedule_to(3, move |_ctx| {
            ran.lock().push("routed");
        });
        assert!(scheduled.is_ok());
    }

    // Everything landed in child 3; child 2 stayed empty.
    let root = factory.root();
    assert_eq!(root.best_effort_count(), 3);

    gate.release();
    assert!(common::wait_until(Duration::from_secs(2), || ran.lock().len() == 3));
}

#[test]
fn unknown_handle_is_a_scheduling_error() {
    let factory = WorkloadFactoryBuilder::new()
        .root_tree(
            QdiscTreeBuilder::round_robin(1)
                .child(QdiscTreeBuilder::fifo(2)),
        )
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    let result = factory.schedule_to(99, |_ctx| {});
    assert!(matches!(result.err(), Some(SchedError::NoRoute(99))));
}

#[test]
fn completed_tree_rejects_enqueues() {
    let factory = WorkloadFactoryBuilder::new()
        .root_fifo(1)
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    factory.complete();
    let result = factory.schedule(|_ctx| {});
    assert!(matches!(result.err(), Some(SchedError::Completed(1))));
}
