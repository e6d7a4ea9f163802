//! In-process database backend.
//!
//! [`MemoryDatabase`] evaluates segment queries over ordered in-memory tables
//! using the same canonical text and row hash as the SQL dialects, so a
//! memory table and a SQL table holding the same data produce the same
//! checksums. It is used by the test suites and for embedding.
//!
//! Instrumentation:
//! - per-operation query counters ([`MemoryDatabase::query_counts`])
//! - in-flight and peak query gauges
//! - optional artificial latency per query
//! - failure injection ([`MemoryDatabase::fail_queries_after`])
//!
//! Tables are stored behind `Arc`, so [`MemoryDatabase::snapshot`] is cheap
//! and later writes to either copy do not affect the other.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use tracing::debug;

use crate::core::checksum::{row_hash, Checksum};
use crate::core::identifier::TablePath;
use crate::core::schema::{ColumnInfo, KeyKind, TableSchema};
use crate::core::range::TimeRange;
use crate::core::traits::{tile_starts, Database, RowStream, SegmentQuery};
use crate::core::value::{DbKey, DbValue, Row};
use crate::error::{DiffError, Result};

const BACKEND: &str = "memory";

/// Default number of queries served at once.
pub const DEFAULT_MEMORY_CONCURRENCY: usize = 64;

/// Rows read from the table per step of a streamed fetch.
const FETCH_PAGE: usize = 256;

/// Sentinel for "failure injection disabled".
const NO_FAILURE: u64 = u64::MAX;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    key_kind: KeyKind,
    /// Non-key column values in schema order, by key.
    rows: BTreeMap<DbKey, Vec<DbValue>>,
}

impl MemoryTable {
    fn key_column(&self) -> &str {
        // create_table guarantees at least one column
        self.schema
            .columns
            .first()
            .map(|c| c.name.as_str())
            .unwrap_or_default()
    }

    fn value_index(&self, table: &TablePath, column: &str) -> Result<usize> {
        self.schema.require(&table.to_string(), column)?;
        self.schema
            .columns
            .iter()
            .skip(1)
            .position(|c| c.name == column)
            .ok_or_else(|| {
                DiffError::Schema(format!(
                    "column \"{}\" is the key of {} and cannot be compared as content",
                    column, table
                ))
            })
    }

    /// Validate a query against this table and resolve its columns.
    fn plan(&self, query: &SegmentQuery<'_>) -> Result<Selection> {
        if query.key_column != self.key_column() {
            self.schema.require(&query.table.to_string(), query.key_column)?;
            return Err(DiffError::Schema(format!(
                "in-memory table {} is keyed by \"{}\", not \"{}\"",
                query.table,
                self.key_column(),
                query.key_column
            )));
        }
        for bound in [&query.key_range.start, &query.key_range.end].into_iter().flatten() {
            if bound.kind() != self.key_kind {
                return Err(DiffError::Schema(format!(
                    "key bound {} is {} but key column \"{}\" is {}",
                    bound,
                    bound.kind(),
                    query.key_column,
                    self.key_kind
                )));
            }
        }

        let compared = query
            .compared_columns()
            .map(|c| self.value_index(query.table, c))
            .collect::<Result<Vec<_>>>()?;
        let update_idx = match query.update_column {
            Some(column) => Some(self.value_index(query.table, column)?),
            None => None,
        };

        Ok(Selection {
            compared,
            update_idx,
            time_range: *query.time_range,
            start: query.key_range.start.clone(),
            end: query.key_range.end.clone(),
        })
    }

    /// Up to `limit` selected rows with keys above `after`, in key order,
    /// reduced to the compared columns.
    fn rows(&self, selection: &Selection, after: Option<&DbKey>, limit: usize) -> Vec<Row> {
        let lower = match (after, &selection.start) {
            (Some(after), _) => Bound::Excluded(after),
            (None, Some(start)) => Bound::Included(start),
            (None, None) => Bound::Unbounded,
        };
        let upper = match &selection.end {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };

        let time_range = selection.time_range;
        self.rows
            .range::<DbKey, _>((lower, upper))
            .filter(|(_, values)| match selection.update_idx {
                Some(idx) if !time_range.is_unbounded() => values[idx]
                    .as_timestamp()
                    .map_or(false, |ts| time_range.contains(&ts)),
                _ => true,
            })
            .take(limit)
            .map(|(key, values)| Row {
                key: key.clone(),
                values: selection.compared.iter().map(|&i| values[i].clone()).collect(),
            })
            .collect()
    }

    fn select(&self, query: &SegmentQuery<'_>) -> Result<Vec<Row>> {
        let selection = self.plan(query)?;
        Ok(self.rows(&selection, None, usize::MAX))
    }
}

/// A validated query with its columns resolved to value positions.
#[derive(Debug)]
struct Selection {
    compared: Vec<usize>,
    update_idx: Option<usize>,
    time_range: TimeRange,
    start: Option<DbKey>,
    end: Option<DbKey>,
}

/// Number of queries served, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryCounts {
    pub describe: u64,
    pub count: u64,
    pub checksum: u64,
    pub count_and_checksum: u64,
    pub checkpoints: u64,
    pub fetch_rows: u64,
}

impl QueryCounts {
    /// Count and checksum queries of any form.
    pub fn aggregates(&self) -> u64 {
        self.count + self.checksum + self.count_and_checksum
    }

    /// Queries touching table rows (everything but describe).
    pub fn range_queries(&self) -> u64 {
        self.aggregates() + self.checkpoints + self.fetch_rows
    }
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Describe,
    Count,
    Checksum,
    CountAndChecksum,
    Checkpoints,
    FetchRows,
}

#[derive(Debug, Default)]
struct Counters {
    describe: AtomicU64,
    count: AtomicU64,
    checksum: AtomicU64,
    count_and_checksum: AtomicU64,
    checkpoints: AtomicU64,
    fetch_rows: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Counters {
    fn record(&self, op: Op) {
        let counter = match op {
            Op::Describe => &self.describe,
            Op::Count => &self.count,
            Op::Checksum => &self.checksum,
            Op::CountAndChecksum => &self.count_and_checksum,
            Op::Checkpoints => &self.checkpoints,
            Op::FetchRows => &self.fetch_rows,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> QueryCounts {
        QueryCounts {
            describe: self.describe.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            checksum: self.checksum.load(Ordering::Relaxed),
            count_and_checksum: self.count_and_checksum.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            fetch_rows: self.fetch_rows.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight gauge when a query finishes or is dropped.
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn enter(counters: &'a Counters) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process [`Database`] over ordered tables.
#[derive(Debug)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<TablePath, Arc<MemoryTable>>>,
    max_concurrency: usize,
    latency: Option<Duration>,
    counters: Counters,
    queries_before_failure: AtomicU64,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            max_concurrency: DEFAULT_MEMORY_CONCURRENCY,
            latency: None,
            counters: Counters::default(),
            queries_before_failure: AtomicU64::new(NO_FAILURE),
        }
    }

    /// Set the number of queries this database reports it can serve at once.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Delay every query by `latency`, simulating a network round trip.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Create (or replace) a table. The first column is the key.
    pub fn create_table(&self, table: &str, columns: Vec<ColumnInfo>) -> Result<()> {
        let path = TablePath::parse(table)?;
        let key = columns.first().ok_or_else(|| {
            DiffError::Precondition(format!("table {} needs at least a key column", path))
        })?;
        let key_kind = KeyKind::from_data_type(&key.data_type).ok_or_else(|| {
            DiffError::Schema(format!(
                "key column \"{}\" has unsupported type {}",
                key.name, key.data_type
            ))
        })?;

        let table = MemoryTable {
            schema: TableSchema::new(columns),
            key_kind,
            rows: BTreeMap::new(),
        };
        self.write_tables().insert(path, Arc::new(table));
        Ok(())
    }

    /// Insert or replace one row. `values` are the non-key columns in order.
    pub fn insert(&self, table: &str, key: impl Into<DbKey>, values: Vec<DbValue>) -> Result<()> {
        self.insert_rows(table, [Row::new(key, values)])
    }

    /// Insert or replace many rows.
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Row>) -> Result<()> {
        self.modify(table, |t| {
            let width = t.schema.columns.len() - 1;
            for row in rows {
                if row.key.kind() != t.key_kind {
                    return Err(DiffError::Precondition(format!(
                        "key {} is {} but the table key is {}",
                        row.key,
                        row.key.kind(),
                        t.key_kind
                    )));
                }
                if row.values.len() != width {
                    return Err(DiffError::Precondition(format!(
                        "row {} has {} values, expected {}",
                        row.key,
                        row.values.len(),
                        width
                    )));
                }
                t.rows.insert(row.key, row.values);
            }
            Ok(())
        })
    }

    /// Set one column of an existing row. Returns false if the key is absent.
    pub fn update(
        &self,
        table: &str,
        key: impl Into<DbKey>,
        column: &str,
        value: impl Into<DbValue>,
    ) -> Result<bool> {
        let key = key.into();
        let value = value.into();
        let path = TablePath::parse(table)?;
        self.modify(table, |t| {
            let idx = t.value_index(&path, column)?;
            Ok(match t.rows.get_mut(&key) {
                Some(values) => {
                    values[idx] = value;
                    true
                }
                None => false,
            })
        })
    }

    /// Delete a row. Returns false if the key is absent.
    pub fn delete(&self, table: &str, key: impl Into<DbKey>) -> Result<bool> {
        let key = key.into();
        self.modify(table, |t| Ok(t.rows.remove(&key).is_some()))
    }

    /// Number of rows stored in a table.
    pub fn row_count(&self, table: &str) -> Result<usize> {
        let path = TablePath::parse(table)?;
        Ok(self.table(&path)?.rows.len())
    }

    /// A new database sharing this one's current data, with fresh counters.
    pub fn snapshot(&self) -> MemoryDatabase {
        MemoryDatabase {
            tables: RwLock::new(self.read_tables().clone()),
            max_concurrency: self.max_concurrency,
            latency: self.latency,
            counters: Counters::default(),
            queries_before_failure: AtomicU64::new(NO_FAILURE),
        }
    }

    /// Queries served so far, by operation.
    pub fn query_counts(&self) -> QueryCounts {
        self.counters.snapshot()
    }

    /// Highest number of queries that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Queries currently running.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Let `n` more queries succeed, then fail every query with a connectivity error.
    pub fn fail_queries_after(&self, n: u64) {
        self.queries_before_failure.store(n, Ordering::SeqCst);
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TablePath, Arc<MemoryTable>>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TablePath, Arc<MemoryTable>>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn table(&self, path: &TablePath) -> Result<Arc<MemoryTable>> {
        self.read_tables()
            .get(path)
            .cloned()
            .ok_or_else(|| DiffError::Schema(format!("table {} does not exist", path)))
    }

    fn modify<T>(&self, table: &str, f: impl FnOnce(&mut MemoryTable) -> Result<T>) -> Result<T> {
        let path = TablePath::parse(table)?;
        let mut tables = self.write_tables();
        let entry = tables
            .get_mut(&path)
            .ok_or_else(|| DiffError::Schema(format!("table {} does not exist", path)))?;
        // copy-on-write when a snapshot still shares this table
        f(Arc::make_mut(entry))
    }

    /// Account for one query, apply latency and failure injection.
    async fn serve<T>(&self, op: Op, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.counters.record(op);
        let _in_flight = InFlight::enter(&self.counters);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let before = self
            .queries_before_failure
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                (remaining != NO_FAILURE).then(|| remaining.saturating_sub(1))
            });
        if before == Ok(0) {
            return Err(DiffError::connectivity(BACKEND, "injected connection failure"));
        }

        f()
    }

    fn select(&self, query: &SegmentQuery<'_>) -> Result<Vec<Row>> {
        let rows = self.table(query.table)?.select(query)?;
        debug!("{}: {} rows in {} {}", BACKEND, rows.len(), query.table, query.key_range);
        Ok(rows)
    }
}

fn checksum_of(rows: &[Row]) -> Checksum {
    rows.iter().map(|row| row_hash(&row.key, &row.values)).sum()
}

#[async_trait]
impl Database for MemoryDatabase {
    fn db_type(&self) -> &str {
        BACKEND
    }

    fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    async fn describe_table(&self, table: &TablePath) -> Result<TableSchema> {
        self.serve(Op::Describe, || Ok(self.table(table)?.schema.clone()))
            .await
    }

    async fn count(&self, query: &SegmentQuery<'_>) -> Result<u64> {
        self.serve(Op::Count, || Ok(self.select(query)?.len() as u64))
            .await
    }

    async fn checksum(&self, query: &SegmentQuery<'_>) -> Result<Checksum> {
        self.serve(Op::Checksum, || Ok(checksum_of(&self.select(query)?)))
            .await
    }

    async fn count_and_checksum(&self, query: &SegmentQuery<'_>) -> Result<(u64, Checksum)> {
        self.serve(Op::CountAndChecksum, || {
            let rows = self.select(query)?;
            Ok((rows.len() as u64, checksum_of(&rows)))
        })
        .await
    }

    async fn checkpoints(&self, query: &SegmentQuery<'_>, n: usize) -> Result<Vec<DbKey>> {
        self.serve(Op::Checkpoints, || {
            let rows = self.select(query)?;
            Ok(tile_starts(rows.len() as u64, n)
                .map(|rn| rows[(rn - 1) as usize].key.clone())
                .collect())
        })
        .await
    }

    async fn fetch_rows(&self, query: &SegmentQuery<'_>) -> Result<RowStream> {
        let (table, selection) = self
            .serve(Op::FetchRows, || {
                let table = self.table(query.table)?;
                let selection = table.plan(query)?;
                Ok((table, selection))
            })
            .await?;
        debug!("{}: streaming {} {}", BACKEND, query.table, query.key_range);

        // pages are read from the table as it was when the fetch started
        let pages = stream::unfold(
            (table, selection, None::<DbKey>, false),
            |(table, selection, after, exhausted)| async move {
                if exhausted {
                    return None;
                }
                let page = table.rows(&selection, after.as_ref(), FETCH_PAGE);
                if page.is_empty() {
                    return None;
                }
                let exhausted = page.len() < FETCH_PAGE;
                let after = page.last().map(|row| row.key.clone());
                Some((page, (table, selection, after, exhausted)))
            },
        );
        Ok(pages
            .flat_map(|page| stream::iter(page.into_iter().map(Ok)))
            .boxed())
    }

    async fn close(&self) {}
}
