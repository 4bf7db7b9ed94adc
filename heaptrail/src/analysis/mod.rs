//! Queries over a materialized allocation history
//!
//! All queries replay the allocation vector in arrival order against an
//! `address → size` map: an allocation records its address, a deallocation
//! of a known address releases it, and a deallocation of an address never
//! seen is ignored (it predates the capture).
//!
//! - **`high_watermark`** - the moment live bytes peaked
//! - **`snapshot_at`** - allocations still live after a prefix of events
//! - **`leaks`** - allocations never released in the whole stream
//! - **`summarize`** - aggregate report for the stats command

use crate::domain::ThreadId;
use crate::reader::Allocation;
use crate::records::AllocatorKind;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// The allocation event index at which live bytes were maximal, and the
/// live-byte count at that moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighWatermark {
    pub index: usize,
    pub peak_memory: u64,
}

/// Scan the history once, tracking live bytes, and report the peak.
///
/// Only allocation events can raise the watermark, so the reported index is
/// the first event to reach the maximum.
#[must_use]
pub fn high_watermark(allocations: &[Allocation]) -> HighWatermark {
    let mut live: HashMap<u64, u64> = HashMap::new();
    let mut live_bytes: u64 = 0;
    let mut peak = HighWatermark::default();

    for (index, allocation) in allocations.iter().enumerate() {
        let record = &allocation.record;
        if record.allocator.is_deallocation() {
            if let Some(size) = live.remove(&record.address) {
                live_bytes -= size;
            }
        } else {
            // An address re-allocated without an intervening free replaces
            // the old entry; live bytes track the sum of the map.
            if let Some(previous) = live.insert(record.address, record.size) {
                live_bytes -= previous;
            }
            live_bytes += record.size;
        }
        if live_bytes > peak.peak_memory {
            peak.peak_memory = live_bytes;
            peak.index = index;
        }
    }
    peak
}

/// One row of a snapshot or leak report: allocations merged by call site
/// and allocator (and thread, unless threads are merged).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRow {
    /// None when rows were merged across threads.
    pub tid: Option<ThreadId>,
    pub frame_index: u32,
    pub allocator: AllocatorKind,
    pub n_allocations: usize,
    pub total_size: u64,
}

/// Replay events `[0..=index]` and report the allocations still live at the
/// end of the prefix, grouped by `(frame_index, allocator)` and, unless
/// `merge_threads`, by thread. Rows are ordered largest first.
#[must_use]
pub fn snapshot_at(
    allocations: &[Allocation],
    index: usize,
    merge_threads: bool,
) -> Vec<SnapshotRow> {
    if allocations.is_empty() {
        return Vec::new();
    }
    let end = index.min(allocations.len() - 1);

    let mut live: HashMap<u64, &Allocation> = HashMap::new();
    for allocation in &allocations[..=end] {
        if allocation.record.allocator.is_deallocation() {
            live.remove(&allocation.record.address);
        } else {
            live.insert(allocation.record.address, allocation);
        }
    }

    let mut rows: HashMap<(Option<ThreadId>, u32, AllocatorKind), (usize, u64)> = HashMap::new();
    for allocation in live.values() {
        let tid = (!merge_threads).then_some(allocation.record.tid);
        let key = (tid, allocation.frame_index, allocation.record.allocator);
        let entry = rows.entry(key).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += allocation.record.size;
    }

    let mut rows: Vec<SnapshotRow> = rows
        .into_iter()
        .map(|((tid, frame_index, allocator), (n_allocations, total_size))| SnapshotRow {
            tid,
            frame_index,
            allocator,
            n_allocations,
            total_size,
        })
        .collect();
    rows.sort_by(|a, b| {
        b.total_size
            .cmp(&a.total_size)
            .then_with(|| a.frame_index.cmp(&b.frame_index))
            .then_with(|| a.tid.cmp(&b.tid))
    });
    rows
}

/// Allocations whose address is never released in the stream.
#[must_use]
pub fn leaks(allocations: &[Allocation], merge_threads: bool) -> Vec<SnapshotRow> {
    if allocations.is_empty() {
        return Vec::new();
    }
    snapshot_at(allocations, allocations.len() - 1, merge_threads)
}

/// Aggregate report over a whole capture, serializable for the stats
/// command's JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct SummaryStats {
    pub total_events: usize,
    pub total_allocations: usize,
    pub total_deallocations: usize,
    pub peak_memory: u64,
    pub peak_index: usize,
    pub leaked_allocations: usize,
    pub leaked_bytes: u64,
    pub allocator_counts: BTreeMap<String, usize>,
}

#[must_use]
pub fn summarize(allocations: &[Allocation]) -> SummaryStats {
    let peak = high_watermark(allocations);
    let leaked = leaks(allocations, true);

    let mut allocator_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_allocations = 0;
    let mut total_deallocations = 0;
    for allocation in allocations {
        let kind = allocation.record.allocator;
        *allocator_counts.entry(kind.name().to_string()).or_insert(0) += 1;
        if kind.is_deallocation() {
            total_deallocations += 1;
        } else {
            total_allocations += 1;
        }
    }

    SummaryStats {
        total_events: allocations.len(),
        total_allocations,
        total_deallocations,
        peak_memory: peak.peak_memory,
        peak_index: peak.index,
        leaked_allocations: leaked.iter().map(|row| row.n_allocations).sum(),
        leaked_bytes: leaked.iter().map(|row| row.total_size).sum(),
        allocator_counts,
    }
}
