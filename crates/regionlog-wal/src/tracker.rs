//! Sequence Tracker
//!
//! Per-region bookkeeping of how far the log has been written and how far
//! the region's memstore has been flushed to durable storage. The roller
//! reads it to decide which closed segments are obsolete; the flush path
//! drives it with `start_flush` / `complete_flush`.
//!
//! ## Flush protocol
//!
//! ```text
//! seq = start_flush(region)        // edits <= seq go into this flush
//!     ... memstore persisted ...
//! complete_flush(region, seq)      // last_flushed = max(last_flushed, seq)
//! ```
//!
//! Edits appended while a flush is running get sequence ids above the
//! snapshot and stay unflushed. The oldest unflushed sequence id of a region
//! under flush is parked in a separate map until the flush completes or
//! aborts, so the roller still sees it.
//!
//! The state lives behind a `std::sync::Mutex`; no lock is held across an
//! `.await`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

/// Sequence state of one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSequence {
    /// Highest sequence id appended for the region
    pub last_assigned_seq: u64,

    /// Highest sequence id covered by a completed flush
    pub last_flushed_seq: Option<u64>,

    /// Lowest sequence id not yet covered by a completed flush, excluding
    /// edits captured by a flush still in progress
    pub oldest_unflushed_seq: Option<u64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    regions: HashMap<Bytes, RegionSequence>,
    /// region -> oldest unflushed sequence id captured by an in-flight flush
    flushing: HashMap<Bytes, u64>,
}

#[derive(Debug, Default)]
pub struct SequenceTracker {
    state: Mutex<TrackerState>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // State is a pair of maps updated in place; a panic mid-update
        // cannot leave them inconsistent across entries.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record that `sequence_id` was assigned to an edit of `region_id`.
    pub fn record_append(&self, region_id: &Bytes, sequence_id: u64) {
        let mut state = self.lock();
        let entry = state.regions.entry(region_id.clone()).or_default();
        entry.last_assigned_seq = entry.last_assigned_seq.max(sequence_id);
        if entry.oldest_unflushed_seq.is_none() {
            entry.oldest_unflushed_seq = Some(sequence_id);
        }
    }

    /// Snapshot the flush point of `region_id`.
    ///
    /// Returns the region's last assigned sequence id, or 0 if nothing was
    /// ever appended for it.
    pub fn start_flush(&self, region_id: &[u8]) -> u64 {
        let mut state = self.lock();
        let TrackerState { regions, flushing } = &mut *state;

        let Some(entry) = regions.get_mut(region_id) else {
            return 0;
        };
        if let Some(oldest) = entry.oldest_unflushed_seq.take() {
            let parked = flushing
                .entry(Bytes::copy_from_slice(region_id))
                .or_insert(oldest);
            *parked = (*parked).min(oldest);
        }

        debug!(
            region = %String::from_utf8_lossy(region_id),
            sequence = entry.last_assigned_seq,
            "Flush started"
        );
        entry.last_assigned_seq
    }

    /// Mark every edit of `region_id` up to `sequence_id` as flushed.
    ///
    /// Monotonic: a lower value than the current flush point is ignored.
    /// A region the tracker does not know (never appended, or removed while
    /// the flush ran) stays unknown.
    pub fn complete_flush(&self, region_id: &[u8], sequence_id: u64) {
        let mut state = self.lock();
        let TrackerState { regions, flushing } = &mut *state;

        let parked = flushing.remove(region_id);
        let Some(entry) = regions.get_mut(region_id) else {
            debug!(
                region = %String::from_utf8_lossy(region_id),
                sequence = sequence_id,
                "Flush completed for unknown region, ignoring"
            );
            return;
        };

        let flushed = entry.last_flushed_seq.map_or(sequence_id, |f| f.max(sequence_id));
        entry.last_flushed_seq = Some(flushed);
        entry.last_assigned_seq = entry.last_assigned_seq.max(flushed);

        // Edits parked by start_flush that lie above the flush point are
        // still unflushed.
        if let Some(p) = parked.filter(|p| *p > flushed) {
            entry.oldest_unflushed_seq = Some(entry.oldest_unflushed_seq.map_or(p, |o| o.min(p)));
        }
        if entry.oldest_unflushed_seq.is_some_and(|o| o <= flushed) {
            entry.oldest_unflushed_seq = if entry.last_assigned_seq > flushed {
                Some(flushed + 1)
            } else {
                None
            };
        }

        debug!(
            region = %String::from_utf8_lossy(region_id),
            flushed = flushed,
            "Flush completed"
        );
    }

    /// Abandon an in-flight flush; its edits count as unflushed again.
    pub fn abort_flush(&self, region_id: &[u8]) {
        let mut state = self.lock();
        let TrackerState { regions, flushing } = &mut *state;

        if let Some(parked) = flushing.remove(region_id) {
            if let Some(entry) = regions.get_mut(region_id) {
                entry.oldest_unflushed_seq =
                    Some(entry.oldest_unflushed_seq.map_or(parked, |o| o.min(parked)));
            }
        }
    }

    /// Drop a region closed on this server. The caller persists the returned
    /// flush point with the region.
    pub fn remove_region(&self, region_id: &[u8]) -> Option<RegionSequence> {
        let mut state = self.lock();
        state.flushing.remove(region_id);
        state.regions.remove(region_id)
    }

    pub fn get(&self, region_id: &[u8]) -> Option<RegionSequence> {
        self.lock().regions.get(region_id).copied()
    }

    pub fn region_count(&self) -> usize {
        self.lock().regions.len()
    }

    /// Lowest sequence id any region still needs, counting in-flight flushes.
    pub fn oldest_unflushed(&self) -> Option<u64> {
        let state = self.lock();
        state
            .regions
            .values()
            .filter_map(|r| r.oldest_unflushed_seq)
            .chain(state.flushing.values().copied())
            .min()
    }

    /// region -> oldest unflushed sequence id, excluding in-flight flushes.
    pub fn unflushed_snapshot(&self) -> HashMap<Bytes, u64> {
        self.lock()
            .regions
            .iter()
            .filter_map(|(region, r)| r.oldest_unflushed_seq.map(|s| (region.clone(), s)))
            .collect()
    }

    /// region -> oldest sequence id captured by an in-flight flush.
    pub fn flushing_snapshot(&self) -> HashMap<Bytes, u64> {
        self.lock().flushing.clone()
    }
}

/// Regions holding edits at or below `threshold`.
///
/// A region qualifies when its `candidate` sequence id is `<= threshold` and
/// `baseline` has no entry for it or a different one, or when only
/// `baseline` knows it and that sequence id is `<= threshold`. Each region
/// is reported once; order is unspecified.
pub fn regions_with_unflushed_edits_older_than(
    threshold: u64,
    candidate: &HashMap<Bytes, u64>,
    baseline: &HashMap<Bytes, u64>,
) -> Vec<Bytes> {
    let mut regions: Vec<Bytes> = candidate
        .iter()
        .filter(|(region, seq)| **seq <= threshold && baseline.get(*region) != Some(*seq))
        .map(|(region, _)| region.clone())
        .collect();

    regions.extend(
        baseline
            .iter()
            .filter(|(region, seq)| **seq <= threshold && !candidate.contains_key(*region))
            .map(|(region, _)| region.clone()),
    );

    regions
}
