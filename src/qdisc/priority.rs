//! Strict-priority leaves
//!
//! `PriorityFifoFast` keeps `k` FIFO bands plus a tokenized bitmap with one
//! bit per band; bit `b` is set iff band `b` is known non-empty. Dequeue
//! scans bands in ascending order; a set bit over an empty band is retracted
//! only through a token CAS so a concurrent enqueuer's signal cannot be lost.
//! The bitmap's 56 data bits cap the band count.
//!
//! `PriorityFifoLocking` has identical semantics behind one coarse mutex; it
//! stays off the hot path and exists for scheduling-correctness comparison.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{SchedError, SchedResult};
use crate::sync::{TokenBitmap, BITMAP_WIDTH};
use crate::workload::Workload;

use super::fifo::StagedQueue;
use super::{check_handle, ClassifyState, Handle, ParentLink, Qdisc, WorkScheduledNotifier};

/// Maximum number of priority bands (one bitmap bit per band)
pub const MAX_BANDS: usize = BITMAP_WIDTH;

/// Selector mapping classification state to a band index
pub type BandSelector = Box<dyn Fn(&dyn ClassifyState) -> Option<usize> + Send + Sync>;

/// Classification state addressing a band by its handle
///
/// Takes precedence over the configured band selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandHandle(pub Handle);

/// Classification state addressing a band by index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandIndex(pub usize);

fn check_bands(bands: usize) -> SchedResult<()> {
    if !(2..=MAX_BANDS).contains(&bands) {
        return Err(SchedError::InvalidBandCount(bands));
    }
    Ok(())
}

/// Resolve the target band: explicit handle, then explicit index, then the
/// user selector, then the default band
fn resolve_band(
    state: Option<&dyn ClassifyState>,
    band_handles: &[Option<Handle>],
    selector: Option<&BandSelector>,
    default_band: usize,
    bands: usize,
) -> usize {
    if let Some(state) = state {
        if let Some(BandHandle(target)) = state.as_any().downcast_ref::<BandHandle>() {
            if let Some(index) = band_handles.iter().position(|h| *h == Some(*target)) {
                return index;
            }
        }
        if let Some(BandIndex(index)) = state.as_any().downcast_ref::<BandIndex>() {
            if *index < bands {
                return *index;
            }
        }
        if let Some(selector) = selector {
            if let Some(index) = selector(state) {
                if index < bands {
                    return index;
                }
            }
        }
    }
    default_band
}

/// Strict-priority qdisc with a lock-free band scan
pub struct PriorityFifoFast {
    handle: Handle,
    bands: Box<[StagedQueue]>,
    band_handles: Vec<Option<Handle>>,
    bitmap: TokenBitmap,
    selector: Option<BandSelector>,
    default_band: usize,
    parent: ParentLink,
    weak_self: Weak<PriorityFifoFast>,
}

impl PriorityFifoFast {
    /// Create a priority qdisc with `bands ∈ [2, 56]` FIFO bands
    pub fn new(handle: Handle, bands: usize) -> SchedResult<Arc<Self>> {
        Self::with_config(handle, bands, None, 0, Vec::new())
    }

    /// Create with a band selector, default band, and optional band handles
    pub fn with_config(
        handle: Handle,
        bands: usize,
        selector: Option<BandSelector>,
        default_band: usize,
        band_handles: Vec<Option<Handle>>,
    ) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        check_bands(bands)?;
        if default_band >= bands {
            return Err(SchedError::InvariantViolation(
                handle,
                format!("default band {default_band} outside of {bands} bands"),
            ));
        }
        for extra in band_handles.iter().flatten() {
            check_handle(*extra)?;
        }
        let mut band_handles = band_handles;
        band_handles.resize(bands, None);
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            bands: (0..bands).map(|_| StagedQueue::new()).collect(),
            band_handles,
            bitmap: TokenBitmap::new(),
            selector,
            default_band,
            parent: ParentLink::new(),
            weak_self: weak_self.clone(),
        }))
    }

    /// Number of bands
    pub fn bands(&self) -> usize {
        self.bands.len()
    }

    fn as_dyn(&self) -> Arc<dyn Qdisc> {
        match self.weak_self.upgrade() {
            Some(strong) => strong,
            None => unreachable!("self-reference outlives the qdisc"),
        }
    }
}

impl Qdisc for PriorityFifoFast {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.bands.iter().all(StagedQueue::is_empty)
    }

    fn best_effort_count(&self) -> usize {
        self.bands.iter().map(StagedQueue::len).sum()
    }

    fn enqueue(&self, workload: Workload, state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        let guard = self.parent.pin(self.handle)?;
        let band = resolve_band(
            state,
            &self.band_handles,
            self.selector.as_ref(),
            self.default_band,
            self.bands.len(),
        );
        workload.bind(&self.as_dyn())?;
        self.bands[band].push(workload);
        self.bitmap.set(band);
        guard.notify();
        Ok(())
    }

    fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<Workload> {
        loop {
            let view = self.bitmap.snapshot();
            let band = view.first_set_from(0)?;
            if let Some(workload) = self.bands[band].pop() {
                return Some(workload);
            }
            // Stale bit: retract it unless an enqueue raced in, then rescan.
            self.bitmap.try_clear(band, view.token);
        }
    }

    fn try_peek(&self, _worker_id: usize) -> Option<Workload> {
        self.bands.iter().find_map(StagedQueue::peek)
    }

    fn try_remove(&self, _workload: &Workload) -> bool {
        false
    }

    fn on_worker_terminated(&self, _worker_id: usize) {}

    fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()> {
        self.parent.initialize(self.handle, parent)
    }

    fn complete(&self) {
        self.parent.complete();
    }

    fn for_each_handle(&self, visit: &mut dyn FnMut(Handle)) {
        visit(self.handle);
        for extra in self.band_handles.iter().flatten() {
            visit(*extra);
        }
    }
}

impl std::fmt::Debug for PriorityFifoFast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityFifoFast")
            .field("handle", &self.handle)
            .field("bands", &self.bands.len())
            .finish()
    }
}

/// Strict-priority qdisc behind one coarse mutex
///
/// Semantically identical to [`PriorityFifoFast`]; supports removal.
pub struct PriorityFifoLocking {
    handle: Handle,
    bands: Mutex<Vec<VecDeque<Workload>>>,
    band_handles: Vec<Option<Handle>>,
    selector: Option<BandSelector>,
    default_band: usize,
    parent: ParentLink,
    weak_self: Weak<PriorityFifoLocking>,
}

impl PriorityFifoLocking {
    /// Create a locking priority qdisc with `bands ∈ [2, 56]` bands
    pub fn new(handle: Handle, bands: usize) -> SchedResult<Arc<Self>> {
        Self::with_config(handle, bands, None, 0, Vec::new())
    }

    /// Create with a band selector, default band, and optional band handles
    pub fn with_config(
        handle: Handle,
        bands: usize,
        selector: Option<BandSelector>,
        default_band: usize,
        band_handles: Vec<Option<Handle>>,
    ) -> SchedResult<Arc<Self>> {
        check_handle(handle)?;
        check_bands(bands)?;
        if default_band >= bands {
            return Err(SchedError::InvariantViolation(
                handle,
                format!("default band {default_band} outside of {bands} bands"),
            ));
        }
        let mut band_handles = band_handles;
        band_handles.resize(bands, None);
        Ok(Arc::new_cyclic(|weak_self| Self {
            handle,
            bands: Mutex::new((0..bands).map(|_| VecDeque::new()).collect()),
            band_handles,
            selector,
            default_band,
            parent: ParentLink::new(),
            weak_self: weak_self.clone(),
        }))
    }

    fn as_dyn(&self) -> Arc<dyn Qdisc> {
        match self.weak_self.upgrade() {
            Some(strong) => strong,
            None => unreachable!("self-reference outlives the qdisc"),
        }
    }
}

impl Qdisc for PriorityFifoLocking {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn is_empty(&self) -> bool {
        self.bands.lock().iter().all(VecDeque::is_empty)
    }

    fn best_effort_count(&self) -> usize {
        self.bands.lock().iter().map(VecDeque::len).sum()
    }

    fn enqueue(&self, workload: Workload, state: Option<&dyn ClassifyState>) -> SchedResult<()> {
        let guard = self.parent.pin(self.handle)?;
        let band = {
            let bands = self.bands.lock();
            resolve_band(
                state,
                &self.band_handles,
                self.selector.as_ref(),
                self.default_band,
                bands.len(),
            )
        };
        workload.bind(&self.as_dyn())?;
        self.bands.lock()[band].push_back(workload);
        guard.notify();
        Ok(())
    }

    fn try_dequeue(&self, _worker_id: usize, _backtrack: bool) -> Option<Workload> {
        let mut bands = self.bands.lock();
        bands.iter_mut().find_map(VecDeque::pop_front)
    }

    fn try_peek(&self, _worker_id: usize) -> Option<Workload> {
        let bands = self.bands.lock();
        bands.iter().find_map(|band| band.front().cloned())
    }

    fn try_remove(&self, workload: &Workload) -> bool {
        let mut bands = self.bands.lock();
        for band in bands.iter_mut() {
            if let Some(position) = band.iter().position(|w| w.same_as(workload)) {
                band.remove(position);
                return true;
            }
        }
        false
    }

    fn on_worker_terminated(&self, _worker_id: usize) {}

    fn initialize(&self, parent: Arc<dyn WorkScheduledNotifier>) -> SchedResult<()> {
        self.parent.initialize(self.handle, parent)
    }

    fn complete(&self) {
        self.parent.complete();
    }

    fn for_each_handle(&self, visit: &mut dyn FnMut(Handle)) {
        visit(self.handle);
        for extra in self.band_handles.iter().flatten() {
            visit(*extra);
        }
    }
}

impl std::fmt::Debug for PriorityFifoLocking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityFifoLocking")
            .field("handle", &self.handle)
            .field("bands", &self.band_handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdisc::test_util::{must, unit_workload as workload, NullNotifier};

    fn fast(bands: usize) -> Arc<PriorityFifoFast> {
        let qdisc = must(PriorityFifoFast::new(5, bands));
        qdisc.initialize(Arc::new(NullNotifier)).ok();
        qdisc
    }

    #[test]
    fn test_band_count_bounds() {
        assert_eq!(
            PriorityFifoFast::new(5, 1).err(),
            Some(SchedError::InvalidBandCount(1))
        );
        assert_eq!(
            PriorityFifoFast::new(5, 57).err(),
            Some(SchedError::InvalidBandCount(57))
        );
        assert!(PriorityFifoFast::new(5, 56).is_ok());
    }

    #[test]
    fn test_strict_priority_order() {
        let qdisc = fast(3);
        let mut tagged = Vec::new();
        for band in [2usize, 0, 2, 1, 0] {
            let w = workload();
            qdisc.enqueue(w.clone(), Some(&BandIndex(band))).ok();
            tagged.push((band, w));
        }

        let mut order = Vec::new();
        while let Some(got) = qdisc.try_dequeue(0, false) {
            let band = tagged
                .iter()
                .find(|(_, w)| w.same_as(&got))
                .map(|(band, _)| *band);
            order.extend(band);
        }
        assert_eq!(order, vec![0, 0, 1, 2, 2]);
    }

    #[test]
    fn test_selector_and_default_band() {
        let selector: BandSelector = Box::new(|state| {
            state
                .as_any()
                .downcast_ref::<u32>()
                .map(|priority| *priority as usize)
        });
        let qdisc = must(PriorityFifoFast::with_config(
            5,
            3,
            Some(selector),
            2,
            Vec::new(),
        ));
        qdisc.initialize(Arc::new(NullNotifier)).ok();

        let urgent = workload();
        let unclassified = workload();
        qdisc.enqueue(urgent.clone(), Some(&0u32)).ok();
        qdisc.enqueue(unclassified.clone(), None).ok();

        let got = qdisc.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&urgent)));
        let got = qdisc.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&unclassified)));
    }

    #[test]
    fn test_band_handle_addressing() {
        let qdisc = must(PriorityFifoFast::with_config(
            5,
            2,
            None,
            0,
            vec![Some(100), Some(200)],
        ));
        qdisc.initialize(Arc::new(NullNotifier)).ok();

        let low = workload();
        qdisc.enqueue(low.clone(), Some(&BandHandle(200))).ok();
        let high = workload();
        qdisc.enqueue(high.clone(), Some(&BandHandle(100))).ok();

        let got = qdisc.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&high)));
    }

    #[test]
    fn test_stale_bit_is_retracted() {
        let qdisc = fast(3);
        let w = workload();
        qdisc.enqueue(w, Some(&BandIndex(1))).ok();

        assert!(qdisc.try_dequeue(0, false).is_some());
        // Band 1's bit may be stale now; a further dequeue must settle on None.
        assert!(qdisc.try_dequeue(0, false).is_none());
        assert!(qdisc.is_empty());
    }

    #[test]
    fn test_locking_variant_supports_remove() {
        let qdisc = must(PriorityFifoLocking::new(6, 3));
        qdisc.initialize(Arc::new(NullNotifier)).ok();

        let w = workload();
        qdisc.enqueue(w.clone(), Some(&BandIndex(1))).ok();
        assert!(qdisc.try_remove(&w));
        assert!(!qdisc.try_remove(&w));
        assert!(qdisc.is_empty());
    }

    #[test]
    fn test_locking_variant_priority_order() {
        let qdisc = must(PriorityFifoLocking::new(6, 3));
        qdisc.initialize(Arc::new(NullNotifier)).ok();

        let low = workload();
        let high = workload();
        qdisc.enqueue(low.clone(), Some(&BandIndex(2))).ok();
        qdisc.enqueue(high.clone(), Some(&BandIndex(0))).ok();

        let got = qdisc.try_dequeue(0, false);
        assert!(got.is_some_and(|w| w.same_as(&high)));
    }
}
