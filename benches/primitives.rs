//! Micro-benchmarks for the hot scheduling paths

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use schedtree::pool::WorkItem;
use schedtree::qdisc::PrioritizationPolicy;
use schedtree::sync::TokenBitmap;
use schedtree::{Dispatch, QdiscTreeBuilder, WorkloadFactory, WorkloadFactoryBuilder};

/// Swallows worker dispatches so benches measure queue costs only
struct NoDispatch;

impl Dispatch for NoDispatch {
    fn dispatch(&self, _item: WorkItem) {}
}

fn workerless_factory(tree: QdiscTreeBuilder) -> WorkloadFactory {
    WorkloadFactoryBuilder::new()
        .max_concurrency(1)
        .dispatch(Arc::new(NoDispatch))
        .root_tree(tree)
        .and_then(|builder| builder.build())
        .expect("bench tree builds")
}

fn bench_bitmap(c: &mut Criterion) {
    let bitmap = TokenBitmap::new();

    c.bench_function("bitmap_set", |b| {
        b.iter(|| {
            bitmap.set(black_box(7));
        });
    });

    c.bench_function("bitmap_snapshot_and_clear", |b| {
        b.iter(|| {
            bitmap.set(7);
            let view = bitmap.snapshot();
            black_box(bitmap.try_clear(7, view.token));
        });
    });
}

fn bench_fifo(c: &mut Criterion) {
    let factory = workerless_factory(QdiscTreeBuilder::fifo(1));

    c.bench_function("fifo_enqueue_dequeue", |b| {
        b.iter(|| {
            factory.schedule(|_ctx| {}).expect("fifo accepts");
            black_box(factory.root().try_dequeue(0, false));
        });
    });
}

fn bench_ring(c: &mut Criterion) {
    let factory = workerless_factory(QdiscTreeBuilder::constrained_fifo(
        1,
        1024,
        PrioritizationPolicy::MinimizeSchedulingDelay,
    ));

    c.bench_function("ring_enqueue_dequeue", |b| {
        b.iter(|| {
            factory.schedule(|_ctx| {}).expect("ring accepts");
            black_box(factory.root().try_dequeue(0, false));
        });
    });
}

fn bench_priority(c: &mut Criterion) {
    let factory = workerless_factory(QdiscTreeBuilder::priority(1, 8).default_band(4));

    c.bench_function("priority_enqueue_dequeue", |b| {
        b.iter(|| {
            factory.schedule(|_ctx| {}).expect("priority accepts");
            black_box(factory.root().try_dequeue(0, false));
        });
    });
}

criterion_group!(benches, bench_bitmap, bench_fifo, bench_ring, bench_priority);
criterion_main!(benches);
