//! Recursive range-bisection differ.
//!
//! [`TableDiffer::diff_tables`] compares two [`TableSegment`]s that describe
//! the same logical rows on two databases. Each range pair is checked with
//! one count+checksum query per side:
//!
//! - both sides empty: nothing to report
//! - either side at or below the bisection threshold: fetch both row sets
//!   and merge-walk them
//! - counts and checksums equal: the range is identical
//! - otherwise: split both sides at the same checkpoints, sampled from the
//!   larger side, and recurse
//!
//! Concurrent runs fan sub-ranges out to a bounded pool of tokio tasks;
//! sequential runs recurse depth-first and yield records in key order.

mod merge;
mod record;
mod stats;
mod stream;

pub use merge::RowMerge;
pub use record::{ColumnChange, DiffRecord};
pub use stats::DiffStats;
pub use stream::DiffStream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DiffError, Result};
use crate::segment::TableSegment;

use stats::StatsRecorder;

/// Default number of sub-ranges per split.
pub const DEFAULT_BISECTION_FACTOR: usize = 32;

/// Default row count at or below which a range is compared row by row.
pub const DEFAULT_BISECTION_THRESHOLD: u64 = 16384;

/// Default number of ranges compared at once.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Records buffered between workers and the consumer.
const RECORD_BUFFER: usize = 1024;

/// Differ settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffOptions {
    /// Sub-ranges per split (at least 2).
    pub bisection_factor: usize,

    /// Ranges with this many rows or fewer on either side are fetched and
    /// merged (at least 1).
    pub bisection_threshold: u64,

    /// Compare sibling ranges and both sides' queries in parallel.
    pub concurrent: bool,

    /// Ranges compared at once (None = DEFAULT_MAX_WORKERS).
    pub max_workers: Option<usize>,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            bisection_factor: DEFAULT_BISECTION_FACTOR,
            bisection_threshold: DEFAULT_BISECTION_THRESHOLD,
            concurrent: true,
            max_workers: None,
        }
    }
}

impl DiffOptions {
    pub fn validate(&self) -> Result<()> {
        if self.bisection_factor < 2 {
            return Err(DiffError::Config(format!(
                "bisection_factor must be at least 2, got {}",
                self.bisection_factor
            )));
        }
        if self.bisection_threshold < 1 {
            return Err(DiffError::Config(
                "bisection_threshold must be at least 1".into(),
            ));
        }
        if self.max_workers == Some(0) {
            return Err(DiffError::Config("max_workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Effective worker count.
    pub fn workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }
}

/// Compares pairs of table segments.
#[derive(Debug, Clone)]
pub struct TableDiffer {
    options: DiffOptions,
}

impl TableDiffer {
    pub fn new(options: DiffOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options })
    }

    pub fn options(&self) -> &DiffOptions {
        &self.options
    }

    /// Start diffing `a` against `b` on the current tokio runtime.
    ///
    /// Records are `Removed` for rows only in `a`, `Added` for rows only in
    /// `b`. Both segments must have the same key and time bounds and the
    /// same number of compared columns. Schema problems are reported as the
    /// first stream item, before any range is queried.
    pub fn diff_tables(&self, a: TableSegment, b: TableSegment) -> DiffStream {
        let (tx, rx) = mpsc::channel(RECORD_BUFFER);
        let stats = Arc::new(StatsRecorder::default());
        let cancel = CancellationToken::new();

        let ctx = Arc::new(DiffContext {
            options: self.options.clone(),
            columns: a.compared_columns().map(str::to_string).collect(),
            tx,
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
            failed: AtomicBool::new(false),
        });
        tokio::spawn(ctx.run(a, b));

        DiffStream::new(rx, stats, cancel)
    }
}

/// Outcome of checking one range pair.
enum Step {
    Done,
    Split(Vec<(TableSegment, TableSegment)>),
}

/// State shared by every range comparison of one run.
struct DiffContext {
    options: DiffOptions,
    columns: Vec<String>,
    tx: mpsc::Sender<Result<DiffRecord>>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
    failed: AtomicBool,
}

impl DiffContext {
    async fn run(self: Arc<Self>, a: TableSegment, b: TableSegment) {
        let started = Instant::now();
        info!(
            "Diffing {} against {} ({} workers, factor {}, threshold {})",
            a,
            b,
            if self.options.concurrent {
                self.options.workers()
            } else {
                1
            },
            self.options.bisection_factor,
            self.options.bisection_threshold
        );

        let b = b.share_budget_with(&a);
        let prepared = self.prepare(&a, &b).await;
        let result = match prepared {
            Ok(()) if self.options.concurrent => Arc::clone(&self).run_concurrent(a, b).await,
            Ok(()) => self.run_sequential(a, b).await,
            Err(e) => Err(e),
        };

        let stats = self.stats.snapshot();
        match result {
            Ok(()) => info!("Diff finished in {:.2?}: {}", started.elapsed(), stats),
            Err(DiffError::Cancelled) => {
                info!("Diff cancelled after {:.2?}: {}", started.elapsed(), stats)
            }
            Err(e) => {
                warn!("Diff failed after {:.2?}: {}", started.elapsed(), e);
                self.fail(e).await;
            }
        }
    }

    /// Validate both segments before any range is queried.
    async fn prepare(&self, a: &TableSegment, b: &TableSegment) -> Result<()> {
        if a.key_range() != b.key_range() {
            return Err(DiffError::Precondition(format!(
                "key ranges differ: {} vs {}",
                a.key_range(),
                b.key_range()
            )));
        }
        if a.time_range() != b.time_range() {
            return Err(DiffError::Precondition(
                "time ranges differ between the two segments".into(),
            ));
        }
        if a.shares_budget_with(b) && a.budget_size() < 2 {
            return Err(DiffError::Precondition(format!(
                "both sides query one database with a budget of {}; merging needs at least 2",
                a.budget_size()
            )));
        }
        let (width_a, width_b) = (a.compared_columns().count(), b.compared_columns().count());
        if width_a != width_b {
            return Err(DiffError::Precondition(format!(
                "{} compares {} columns but {} compares {}",
                a.table(),
                width_a,
                b.table(),
                width_b
            )));
        }

        let (kind_a, kind_b) = tokio::try_join!(a.describe(), b.describe())?;
        if kind_a != kind_b {
            return Err(DiffError::Schema(format!(
                "key \"{}\" of {} is {} but key \"{}\" of {} is {}",
                a.key_column(),
                a.table(),
                kind_a,
                b.key_column(),
                b.table(),
                kind_b
            )));
        }
        Ok(())
    }

    /// Depth-first, in checkpoint order.
    fn run_sequential(&self, a: TableSegment, b: TableSegment) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Step::Split(parts) = self.compare_range(&a, &b).await? {
                for (a, b) in parts {
                    self.run_sequential(a, b).await?;
                }
            }
            Ok(())
        })
    }

    async fn run_concurrent(self: Arc<Self>, a: TableSegment, b: TableSegment) -> Result<()> {
        let workers = Arc::new(Semaphore::new(self.options.workers()));
        let mut tasks = JoinSet::new();
        self.spawn_range(&mut tasks, &workers, a, b);

        while let Some(joined) = tasks.join_next().await {
            match joined? {
                Ok(Step::Done) => {}
                Ok(Step::Split(parts)) => {
                    for (a, b) in parts {
                        if self.cancel.is_cancelled() {
                            break;
                        }
                        self.spawn_range(&mut tasks, &workers, a, b);
                    }
                }
                // let in-flight ranges drain
                Err(DiffError::Cancelled) if self.cancel.is_cancelled() => {}
                Err(e) => return Err(e),
            }
        }

        if self.cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }
        Ok(())
    }

    fn spawn_range(
        self: &Arc<Self>,
        tasks: &mut JoinSet<Result<Step>>,
        workers: &Arc<Semaphore>,
        a: TableSegment,
        b: TableSegment,
    ) {
        let ctx = Arc::clone(self);
        let workers = Arc::clone(workers);
        tasks.spawn(async move {
            // held for this range's queries and merge only, not for its children
            let _permit = tokio::select! {
                permit = workers.acquire_owned() => permit.map_err(|_| DiffError::Cancelled)?,
                _ = ctx.cancel.cancelled() => return Err(DiffError::Cancelled),
            };
            ctx.compare_range(&a, &b).await
        });
    }

    /// Check one range pair and either resolve it or split it.
    async fn compare_range(&self, a: &TableSegment, b: &TableSegment) -> Result<Step> {
        if self.cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }
        let _active = self.stats.range_active();
        self.stats.range_checked();

        let ((count_a, sum_a), (count_b, sum_b)) = if self.options.concurrent {
            tokio::try_join!(a.count_and_checksum(), b.count_and_checksum())?
        } else {
            (a.count_and_checksum().await?, b.count_and_checksum().await?)
        };
        let range = a.key_range();

        if count_a == 0 && count_b == 0 {
            debug!("{}: empty on both sides", range);
            return Ok(Step::Done);
        }

        let threshold = self.options.bisection_threshold;
        if count_a <= threshold || count_b <= threshold {
            self.compare_rows(a, b).await?;
            return Ok(Step::Done);
        }

        if count_a == count_b && sum_a == sum_b {
            debug!("{}: {} rows identical", range, count_a);
            self.stats.range_pruned();
            return Ok(Step::Done);
        }

        let sampled = if count_a >= count_b { a } else { b };
        let checkpoints = sampled.checkpoints(self.options.bisection_factor).await?;
        if checkpoints.is_empty() {
            self.compare_rows(a, b).await?;
            return Ok(Step::Done);
        }

        let parts: Vec<_> = a
            .split(&checkpoints)?
            .into_iter()
            .zip(b.split(&checkpoints)?)
            .collect();
        debug!(
            "{}: {} vs {} rows, splitting into {}",
            range,
            count_a,
            count_b,
            parts.len()
        );
        self.stats.range_split();
        Ok(Step::Split(parts))
    }

    /// Stream both row sets and emit their differences as the merge finds
    /// them.
    async fn compare_rows(&self, a: &TableSegment, b: &TableSegment) -> Result<()> {
        let (rows_a, rows_b) = TableSegment::fetch_pair(a, b).await?;
        self.stats.leaf_compared();

        let mut merge = RowMerge::new(rows_a, rows_b, &self.columns);
        let mut reported = 0;
        let mut differences = 0u64;
        loop {
            let record = merge.next_record().await?;
            let fetched = merge.rows_fetched();
            self.stats.rows_fetched(fetched - reported);
            reported = fetched;

            match record {
                Some(record) => {
                    differences += 1;
                    self.emit(record).await?;
                }
                None => break,
            }
        }
        debug!(
            "{}: compared {} rows, {} differences",
            a.key_range(),
            reported,
            differences
        );
        Ok(())
    }

    async fn emit(&self, record: DiffRecord) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(DiffError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DiffError::Cancelled),
            sent = self.tx.send(Ok(record)) => {
                sent.map_err(|_| DiffError::Cancelled)?;
                self.stats.record_emitted();
                Ok(())
            }
        }
    }

    /// Deliver the first error as the final item and stop the run.
    async fn fail(&self, err: DiffError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        // the consumer may already be gone
        let _ = self.tx.send(Err(err)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = DiffOptions::default();
        assert_eq!(options.bisection_factor, 32);
        assert_eq!(options.bisection_threshold, 16384);
        assert!(options.concurrent);
        assert_eq!(options.workers(), DEFAULT_MAX_WORKERS);
        assert!(TableDiffer::new(options).is_ok());
    }

    #[test]
    fn test_rejects_invalid_options() {
        let bad = [
            DiffOptions {
                bisection_factor: 1,
                ..Default::default()
            },
            DiffOptions {
                bisection_threshold: 0,
                ..Default::default()
            },
            DiffOptions {
                max_workers: Some(0),
                ..Default::default()
            },
        ];
        for options in bad {
            let err = TableDiffer::new(options).unwrap_err();
            assert!(matches!(err, DiffError::Config(_)));
        }
    }

    #[test]
    fn test_options_from_partial_yaml() {
        let options: DiffOptions = serde_yaml::from_str("bisection_factor: 4\nconcurrent: false\n").unwrap();
        assert_eq!(options.bisection_factor, 4);
        assert_eq!(options.bisection_threshold, DEFAULT_BISECTION_THRESHOLD);
        assert!(!options.concurrent);
    }
}
