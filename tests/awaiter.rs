//! Awaiter integration: typed results, faults, and async payloads

use std::sync::Arc;
use std::time::Duration;

use schedtree::error::WorkloadFailure;
use schedtree::{ThreadDispatch, TokioDispatch, WorkloadFactoryBuilder};

fn thread_factory() -> schedtree::WorkloadFactory {
    WorkloadFactoryBuilder::new()
        .max_concurrency(2)
        .dispatch(Arc::new(ThreadDispatch))
        .root_fifo(1)
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"))
}

#[tokio::test]
async fn awaiting_a_value_payload_returns_the_result() {
    let factory = thread_factory();

    let handle = factory
        .submit(|_ctx| 6 * 7)
        .unwrap_or_else(|err| panic!("enqueue failed: {err}"));

    let result: Result<i32, _> = handle.await;
    assert_eq!(result.ok(), Some(42));
}

#[tokio::test]
async fn awaiting_a_faulted_payload_surfaces_the_fault() {
    let factory = thread_factory();

    let handle = factory
        .submit::<i32, _>(|_ctx| panic!("exploded"))
        .unwrap_or_else(|err| panic!("enqueue failed: {err}"));

    match handle.await {
        Err(WorkloadFailure::Faulted(fault)) => assert_eq!(fault.message, "exploded"),
        other => panic!("expected fault, got {other:?}"),
    }
}

#[tokio::test]
async fn async_payloads_run_to_completion_on_workers() {
    let factory = WorkloadFactoryBuilder::new()
        .max_concurrency(2)
        .dispatch(Arc::new(TokioDispatch::current()))
        .root_fifo(1)
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    let handle = factory
        .submit_async(|_ctx| async {
            // Workers drive futures with a plain executor, so the payload
            // must not depend on a runtime reactor.
            std::thread::sleep(Duration::from_millis(5));
            "done"
        })
        .unwrap_or_else(|err| panic!("enqueue failed: {err}"));

    let result: Result<&str, _> = handle.await;
    assert_eq!(result.ok(), Some("done"));
}

#[test]
fn on_completed_consumes_the_typed_result() {
    let factory = thread_factory();
    let (tx, rx) = std::sync::mpsc::channel();

    let handle = factory
        .submit(|_ctx| String::from("payload result"))
        .unwrap_or_else(|err| panic!("enqueue failed: {err}"));
    handle.on_completed(move |result: Result<String, _>| {
        tx.send(result.ok()).ok();
    });

    let received = rx.recv_timeout(Duration::from_secs(2));
    assert_eq!(received.ok().flatten().as_deref(), Some("payload result"));
}
