//! Run statistics.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for one diff run, as of the moment they were read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    /// Range pairs whose counts and checksums were queried.
    pub ranges_checked: u64,
    /// Ranges found identical by checksum.
    pub ranges_pruned: u64,
    /// Ranges split into sub-ranges.
    pub ranges_split: u64,
    /// Ranges resolved by fetching and merging rows.
    pub leaves_compared: u64,
    /// Rows fetched across both sides.
    pub rows_fetched: u64,
    /// Records yielded.
    pub records_emitted: u64,
    /// Most ranges being compared at the same moment.
    pub peak_active_ranges: u64,
}

impl fmt::Display for DiffStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ranges checked ({} pruned, {} split, {} compared row by row, \
             at most {} at once), {} rows fetched, {} differences",
            self.ranges_checked,
            self.ranges_pruned,
            self.ranges_split,
            self.leaves_compared,
            self.peak_active_ranges,
            self.rows_fetched,
            self.records_emitted
        )
    }
}

/// Shared counters updated by range workers.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    ranges_checked: AtomicU64,
    ranges_pruned: AtomicU64,
    ranges_split: AtomicU64,
    leaves_compared: AtomicU64,
    rows_fetched: AtomicU64,
    records_emitted: AtomicU64,
    active_ranges: AtomicU64,
    peak_active_ranges: AtomicU64,
}

impl StatsRecorder {
    pub fn range_checked(&self) {
        self.ranges_checked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn range_pruned(&self) {
        self.ranges_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn range_split(&self) {
        self.ranges_split.fetch_add(1, Ordering::Relaxed);
    }

    pub fn leaf_compared(&self) {
        self.leaves_compared.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rows_fetched(&self, rows: u64) {
        self.rows_fetched.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_emitted(&self) {
        self.records_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a range as in progress until the guard drops.
    pub fn range_active(&self) -> ActiveRange<'_> {
        let now = self.active_ranges.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_ranges.fetch_max(now, Ordering::SeqCst);
        ActiveRange(self)
    }

    pub fn snapshot(&self) -> DiffStats {
        DiffStats {
            ranges_checked: self.ranges_checked.load(Ordering::Relaxed),
            ranges_pruned: self.ranges_pruned.load(Ordering::Relaxed),
            ranges_split: self.ranges_split.load(Ordering::Relaxed),
            leaves_compared: self.leaves_compared.load(Ordering::Relaxed),
            rows_fetched: self.rows_fetched.load(Ordering::Relaxed),
            records_emitted: self.records_emitted.load(Ordering::Relaxed),
            peak_active_ranges: self.peak_active_ranges.load(Ordering::SeqCst),
        }
    }
}

pub(crate) struct ActiveRange<'a>(&'a StatsRecorder);

impl Drop for ActiveRange<'_> {
    fn drop(&mut self) {
        self.0.active_ranges.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_active_ranges_outlives_the_guards() {
        let stats = StatsRecorder::default();
        {
            let _first = stats.range_active();
            let _second = stats.range_active();
        }
        let _third = stats.range_active();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.peak_active_ranges, 2);
        assert_eq!(stats.active_ranges.load(Ordering::SeqCst), 1);
    }
}
