//! Worker pool and dispatch loop
//!
//! Workers are cooperative: the root qdisc's "work scheduled" notifications
//! spawn them (up to the configured maximum, enforced by a CAS loop), they
//! draw workloads from the root until it runs dry, and they retire through
//! the worker-replacement protocol: decrement, re-sample the tree, and
//! either re-enter or exit for good. Exiting workers prune their per-worker
//! cursor state throughout the tree.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::logsink::{EventKind, LogSink};
use crate::qdisc::{Qdisc, WorkScheduledNotifier};
use crate::workload::{DequeueDecision, Workload, WorkloadStatus};

use super::dispatch::Dispatch;
use super::provider::ServiceProviderFactory;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread is currently inside a worker dispatch loop
///
/// Continuation wrappers consult this to decide between inline execution and
/// a fresh dispatch.
pub fn is_worker_thread() -> bool {
    IN_WORKER.get()
}

pub(crate) struct WorkerPool {
    root: Arc<dyn Qdisc>,
    dispatch: Arc<dyn Dispatch>,
    max_workers: usize,
    current: AtomicUsize,
    slots: Box<[AtomicBool]>,
    sink: Arc<dyn LogSink>,
    provider: Option<Arc<dyn ServiceProviderFactory>>,
}

impl WorkerPool {
    pub(crate) fn new(
        root: Arc<dyn Qdisc>,
        dispatch: Arc<dyn Dispatch>,
        max_workers: usize,
        sink: Arc<dyn LogSink>,
        provider: Option<Arc<dyn ServiceProviderFactory>>,
    ) -> Arc<Self> {
        let max_workers = max_workers.max(1);
        Arc::new(Self {
            root,
            dispatch,
            max_workers,
            current: AtomicUsize::new(0),
            slots: (0..max_workers).map(|_| AtomicBool::new(false)).collect(),
            sink,
            provider,
        })
    }

    /// Configured maximum concurrency
    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers currently accounted for; never exceeds the maximum
    pub(crate) fn current_workers(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// The ambient pool worker loops are dispatched onto
    pub(crate) fn dispatcher(&self) -> Arc<dyn Dispatch> {
        self.dispatch.clone()
    }

    /// CAS `current` upward, bounded by the maximum
    fn try_increment(&self) -> bool {
        let mut current = self.current.load(Ordering::Relaxed);
        loop {
            if current >= self.max_workers {
                return false;
            }
            match self.current.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claim a free worker id in `[0, N)`
    ///
    /// Capacity was already reserved through `current`, so a slot is free or
    /// about to be: a retiring worker releases its slot moments after the
    /// decrement that made this reservation possible.
    fn claim_slot(&self) -> usize {
        loop {
            for (id, slot) in self.slots.iter().enumerate() {
                if slot
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return id;
                }
            }
            std::hint::spin_loop();
        }
    }

    /// Spawn one worker if the pool is below its maximum
    pub(crate) fn try_spawn(self: &Arc<Self>) {
        if !self.try_increment() {
            return;
        }
        let worker_id = self.claim_slot();
        let pool = self.clone();
        self.sink.record(
            EventKind::Event,
            &format!("worker {worker_id} dispatched ({} active)", self.current_workers()),
        );
        self.dispatch.dispatch(Box::new(move || {
            pool.worker_loop(worker_id);
        }));
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize) {
        IN_WORKER.set(true);
        let _scope = self.provider.as_ref().map(|p| p.acquire_scope());
        let exit = ExitGuard {
            pool: self.as_ref(),
            worker_id,
        };

        let mut backtrack = false;
        loop {
            match self.root.try_dequeue(worker_id, backtrack) {
                Some(workload) => {
                    backtrack = !self.run_one(workload);
                }
                None => {
                    // Worker-replacement race: surrender the slot in the
                    // count, then re-check whether work arrived in between.
                    self.current.fetch_sub(1, Ordering::AcqRel);
                    if self.root.best_effort_count() > 0 && self.try_increment() {
                        backtrack = false;
                        continue;
                    }
                    break;
                }
            }
        }

        drop(exit);
    }

    /// Execute one dequeued workload; `false` means the step must back-track
    fn run_one(&self, workload: Workload) -> bool {
        match workload.begin_dequeue() {
            DequeueDecision::Run => {
                workload.execute();
                if workload.status() == WorkloadStatus::Faulted {
                    if let Some(failure) = workload.completion_view().failure {
                        self.sink
                            .record(EventKind::Exception, &failure.to_string());
                    }
                }
                true
            }
            DequeueDecision::AlreadyCanceled | DequeueDecision::Stale => false,
        }
    }

    fn retire(&self, worker_id: usize) {
        self.root.on_worker_terminated(worker_id);
        self.slots[worker_id].store(false, Ordering::Release);
        self.sink.record(
            EventKind::Event,
            &format!("worker {worker_id} retired ({} active)", self.current_workers()),
        );
    }
}

/// Runs retirement bookkeeping even when a worker unwinds
struct ExitGuard<'a> {
    pool: &'a WorkerPool,
    worker_id: usize,
}

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // The dequeue-or-exit protocol never reached its decrement.
            self.pool.current.fetch_sub(1, Ordering::AcqRel);
            self.pool.sink.record(
                EventKind::Error,
                &format!("worker {} terminated by panic", self.worker_id),
            );
        }
        self.pool.retire(self.worker_id);
        // Blocking-pool threads are reused; never leak the worker flag.
        IN_WORKER.set(false);
    }
}

/// Root notifier: a committed enqueue anywhere in the tree wakes the pool
pub(crate) struct WorkerGate {
    pool: Weak<WorkerPool>,
}

impl WorkerGate {
    pub(crate) fn new(pool: &Arc<WorkerPool>) -> Self {
        Self {
            pool: Arc::downgrade(pool),
        }
    }
}

impl WorkScheduledNotifier for WorkerGate {
    fn on_work_scheduled(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.try_spawn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logsink::NullSink;
    use crate::pool::dispatch::ThreadDispatch;
    use crate::qdisc::fifo::Fifo;
    use crate::qdisc::test_util::must;
    use crate::workload::payload::Payload;
    use parking_lot::Mutex;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_notification_spawns_worker_and_drains() {
        let root = must(Fifo::new(1));
        // A single worker keeps the FIFO execution order observable.
        let pool = WorkerPool::new(
            root.clone(),
            Arc::new(ThreadDispatch),
            1,
            Arc::new(NullSink),
            None,
        );
        root.initialize(Arc::new(WorkerGate::new(&pool))).ok();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for value in 1..=4 {
            let seen = seen.clone();
            let (payload, id) = Payload::unit(move |_ctx| {
                seen.lock().push(value);
            });
            let workload = Workload::new(payload, id, None, false);
            root.enqueue(workload, None).ok();
        }

        assert!(wait_until(Duration::from_secs(2), || seen.lock().len() == 4));
        assert!(wait_until(Duration::from_secs(2), || pool.current_workers() == 0));
        assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_worker_cap_holds_under_storm() {
        let root = must(Fifo::new(1));
        let pool = WorkerPool::new(
            root.clone(),
            Arc::new(ThreadDispatch),
            3,
            Arc::new(NullSink),
            None,
        );
        root.initialize(Arc::new(WorkerGate::new(&pool))).ok();

        let max_seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let pool_probe = pool.clone();
            let max_seen = max_seen.clone();
            let (payload, id) = Payload::unit(move |_ctx| {
                let seen = pool_probe.current_workers();
                max_seen.fetch_max(seen, Ordering::AcqRel);
                std::thread::sleep(Duration::from_millis(1));
            });
            let workload = Workload::new(payload, id, None, false);
            root.enqueue(workload, None).ok();
        }

        assert!(wait_until(Duration::from_secs(5), || root.is_empty()
            && pool.current_workers() == 0));
        assert!(max_seen.load(Ordering::Acquire) <= 3);
    }
}
