//! Fair queuing: equal weights converge to an even split

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use schedtree::qdisc::{FairnessConfig, PreferredFairness};
use schedtree::{QdiscTreeBuilder, WorkloadFactoryBuilder};

/// Classification state: which client a payload belongs to
struct Client(u8);

#[test]
fn equal_weights_split_evenly() {
    let gate = common::GatedDispatch::new();
    let config = FairnessConfig {
        preferred_fairness: PreferredFairness::LongTerm,
        ..FairnessConfig::default()
    };
    let tree = QdiscTreeBuilder::fair_with(1, config)
        .weighted_child_classified::<Client, _>(QdiscTreeBuilder::fifo(2), 1, |c| c.0 == 0)
        .weighted_child_classified::<Client, _>(QdiscTreeBuilder::fifo(3), 1, |c| c.0 == 1);

    let factory = WorkloadFactoryBuilder::new()
        .max_concurrency(1)
        .dispatch(Arc::new(gate.clone()))
        .root_tree(tree)
        .and_then(|builder| builder.build())
        .unwrap_or_else(|err| panic!("factory build failed: {err}"));

    const PER_CLIENT: usize = 50;
    let served = Arc::new(Mutex::new((0usize, 0usize)));
    let mut workloads = Vec::new();
    for client in [0u8, 1] {
        for _ in 0..PER_CLIENT {
            let served = served.clone();
            let scheduled = factory.schedule_classified(&Client(client), move |_ctx| {
                // Identical short payloads on both streams.
                std::thread::sleep(Duration::from_millis(1));
                let mut counts = served.lock();
                if client == 0 {
                    counts.0 += 1;
                } else {
                    counts.1 += 1;
                }
            });
            match scheduled {
                Ok(workload) => workloads.push(workload),
                Err(err) => panic!("enqueue failed: {err}"),
            }
        }
    }

    gate.release();

    // Sample the split mid-drain: it must stay within 10% the whole way.
    let balanced = common::wait_until(Duration::from_secs(10), || {
        let (a, b) = *served.lock();
        let total = a + b;
        if total >= 20 && total < 2 * PER_CLIENT {
            let spread = a.abs_diff(b) as f64 / a.max(b).max(1) as f64;
            assert!(spread <= 0.1, "unfair split mid-drain: {a} vs {b}");
        }
        total == 2 * PER_CLIENT
    });
    assert!(balanced, "streams did not drain in time");

    let (a, b) = *served.lock();
    assert_eq!(a + b, 2 * PER_CLIENT);
    let spread = a.abs_diff(b) as f64 / a.max(b).max(1) as f64;
    assert!(spread <= 0.1, "unfair final split: {a} vs {b}");
}
