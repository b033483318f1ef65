//! Virtual-time table
//!
//! A concurrent map from payload identity to timing statistics: sample
//! count, rolling mean of execution ticks, and mean absolute deviation.
//! Updates run Welford-style under per-field CAS loops; a losing CAS only
//! enlarges the total error by O(1/n), so the statistics are eventually
//! consistent without an entry-wide lock.
//!
//! Fair qdiscs read the table to derive best-/average-/worst-case estimates
//! for their virtual-time penalties; the measurement wrapper writes into it
//! through probes attached to dequeued workloads.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::workload::{PayloadId, Workload};

/// Moment of a timing distribution used for a scheduling decision or penalty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeModel {
    /// Rolling mean
    Average,
    /// `mean − mad`, clamped at zero
    BestCase,
    /// `mean + mad`
    WorstCase,
}

/// Clock backing the table's tick measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickSource {
    /// Nanosecond-resolution monotonic clock
    Precise,
    /// Millisecond-granularity coarse ticks
    Fast,
}

impl TickSource {
    fn ticks_since(self, epoch: Instant) -> u64 {
        match self {
            TickSource::Precise => epoch.elapsed().as_nanos() as u64,
            TickSource::Fast => epoch.elapsed().as_millis() as u64,
        }
    }
}

/// Retained-weight cap applied under "sample forever" so the table never
/// grows its influence without bound
const SAMPLE_SATURATION: u32 = u32::MAX - 1;

#[derive(Debug, Default)]
struct VtimeEntry {
    count: AtomicU32,
    mean_bits: AtomicU64,
    mad_bits: AtomicU64,
}

impl VtimeEntry {
    fn fold(&self, sample: f64, limit: u32) {
        // Sample count saturates at the limit; later samples keep folding in
        // at the saturated weight.
        let n = match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            }) {
            Ok(previous) => previous + 1,
            Err(_) => limit,
        };
        let weight = f64::from(n.max(1));

        let mut mean = 0.0;
        let _ = self
            .mean_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                mean = current + (sample - current) / weight;
                Some(mean.to_bits())
            });
        let deviation = (sample - mean).abs();
        let _ = self
            .mad_bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                Some((current + (deviation - current) / weight).to_bits())
            });
    }

    fn snapshot(&self) -> (u32, f64, f64) {
        (
            self.count.load(Ordering::Acquire),
            f64::from_bits(self.mean_bits.load(Ordering::Acquire)),
            f64::from_bits(self.mad_bits.load(Ordering::Acquire)),
        )
    }
}

/// Per-payload timing statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PayloadTiming {
    /// Samples folded in so far (saturating)
    pub samples: u32,
    /// Rolling mean execution ticks
    pub mean: f64,
    /// Mean absolute deviation in ticks
    pub mad: f64,
}

impl PayloadTiming {
    /// Estimate under the given time model
    pub fn estimate(&self, model: TimeModel) -> f64 {
        match model {
            TimeModel::Average => self.mean,
            TimeModel::BestCase => (self.mean - self.mad).max(0.0),
            TimeModel::WorstCase => self.mean + self.mad,
        }
    }
}

/// Concurrent per-payload timing table
pub struct VirtualTimeTable {
    entries: DashMap<PayloadId, VtimeEntry>,
    epoch: Instant,
    source: TickSource,
    sample_limit: u32,
}

impl VirtualTimeTable {
    /// Create a table
    ///
    /// `sample_limit` of `−1` means "sample forever" (internally saturated);
    /// positive values stop the count at the limit.
    /// `expected_distinct_payloads` is a capacity hint.
    pub fn new(source: TickSource, sample_limit: i64, expected_distinct_payloads: usize) -> Self {
        let limit = if sample_limit < 0 {
            SAMPLE_SATURATION
        } else {
            (sample_limit as u64).min(u64::from(SAMPLE_SATURATION)).max(1) as u32
        };
        Self {
            entries: DashMap::with_capacity(expected_distinct_payloads),
            epoch: Instant::now(),
            source,
            sample_limit: limit,
        }
    }

    /// Current tick reading
    pub fn now_ticks(&self) -> u64 {
        self.source.ticks_since(self.epoch)
    }

    /// Fold one execution-time sample into the entry for `payload`
    pub fn record(&self, payload: PayloadId, ticks: f64) {
        self.entries
            .entry(payload)
            .or_default()
            .fold(ticks.max(0.0), self.sample_limit);
    }

    /// Timing snapshot for `payload`, if any samples exist
    pub fn timing(&self, payload: PayloadId) -> Option<PayloadTiming> {
        let entry = self.entries.get(&payload)?;
        let (samples, mean, mad) = entry.snapshot();
        if samples == 0 {
            return None;
        }
        Some(PayloadTiming { samples, mean, mad })
    }

    /// Estimate for `payload` under `model`, or `default_ticks` when unknown
    pub fn estimate_or(&self, payload: PayloadId, model: TimeModel, default_ticks: f64) -> f64 {
        self.timing(payload)
            .map_or(default_ticks, |timing| timing.estimate(model))
    }

    /// Number of distinct payloads tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no payload has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for VirtualTimeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualTimeTable")
            .field("payloads", &self.entries.len())
            .field("source", &self.source)
            .finish()
    }
}

const PROBE_POOL_RETAIN: usize = 32;

thread_local! {
    static PROBE_POOL: RefCell<Vec<Box<MeasurementProbe>>> = const { RefCell::new(Vec::new()) };
}

/// Execution-time measurement attached to a dequeued workload
///
/// Probes are rented from a thread-local pool at dequeue time and recycled
/// after recording, so steady-state measurement does not allocate.
pub struct MeasurementProbe {
    table: Option<Arc<VirtualTimeTable>>,
    start_ticks: u64,
}

impl MeasurementProbe {
    /// Rent a probe stamped with the current tick reading
    pub fn rent(table: Arc<VirtualTimeTable>) -> Box<Self> {
        let start_ticks = table.now_ticks();
        let mut probe = PROBE_POOL.with(|pool| pool.borrow_mut().pop()).unwrap_or_else(|| {
            Box::new(MeasurementProbe {
                table: None,
                start_ticks: 0,
            })
        });
        probe.table = Some(table);
        probe.start_ticks = start_ticks;
        probe
    }

    /// Record `(end − start)` ticks for the workload's payload and recycle
    pub(crate) fn complete(mut self: Box<Self>, workload: &Workload) {
        if let Some(table) = self.table.take() {
            let elapsed = table.now_ticks().saturating_sub(self.start_ticks);
            table.record(workload.payload_id(), elapsed as f64);
        }
        PROBE_POOL.with(|pool| {
            let mut pool = pool.borrow_mut();
            if pool.len() < PROBE_POOL_RETAIN {
                pool.push(self);
            }
        });
    }
}

impl std::fmt::Debug for MeasurementProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementProbe")
            .field("start_ticks", &self.start_ticks)
            .finish()
    }
}
