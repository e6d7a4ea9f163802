//! Table segments: bounded, immutable slices of one table.
//!
//! A [`TableSegment`] names a table on one database, the key column it is
//! bisected along, the columns compared as row content and the key and time
//! bounds of the slice. Splitting a segment produces sub-segments that share
//! the parent's database handle and concurrency budget.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::core::checksum::Checksum;
use crate::core::identifier::{validate_identifier, TablePath};
use crate::core::range::{KeyRange, TimeRange};
use crate::core::schema::{is_date_type, is_timezone_naive, KeyKind};
use crate::core::traits::{Database, RowStream, SegmentQuery};
use crate::core::value::{DbKey, DbTime, Row};
use crate::error::{DiffError, Result};

/// One side of a comparison: a key/time-bounded slice of a table.
#[derive(Clone)]
pub struct TableSegment {
    db: Arc<dyn Database>,
    table: TablePath,
    key_column: String,
    update_column: Option<String>,
    extra_columns: Vec<String>,
    key_range: KeyRange,
    time_range: TimeRange,
    budget: Arc<Semaphore>,
    budget_size: usize,
}

impl TableSegment {
    /// Segment covering the whole table, with a query budget equal to the
    /// database's `max_concurrency`.
    pub fn new(db: Arc<dyn Database>, table: TablePath, key_column: impl Into<String>) -> Result<Self> {
        let key_column = key_column.into();
        validate_identifier(&key_column)?;
        let budget_size = db.max_concurrency().max(1);
        Ok(Self {
            db,
            table,
            key_column,
            update_column: None,
            extra_columns: Vec::new(),
            key_range: KeyRange::all(),
            time_range: TimeRange::default(),
            budget: Arc::new(Semaphore::new(budget_size)),
            budget_size,
        })
    }

    /// Compare and time-filter by this column.
    pub fn with_update_column(mut self, column: impl Into<String>) -> Result<Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.check_not_compared(&column)?;
        self.update_column = Some(column);
        Ok(self)
    }

    /// Compare these columns as row content, in order.
    pub fn with_extra_columns<I, S>(mut self, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_columns.clear();
        for column in columns {
            let column = column.into();
            validate_identifier(&column)?;
            self.check_not_compared(&column)?;
            self.extra_columns.push(column);
        }
        Ok(self)
    }

    /// Restrict to keys in `[start, end)`.
    pub fn with_key_range(mut self, start: Option<DbKey>, end: Option<DbKey>) -> Result<Self> {
        self.key_range = KeyRange::new(start, end)?;
        Ok(self)
    }

    /// Restrict to rows whose update column lies in `[min, max]`.
    ///
    /// Requires an update column.
    pub fn with_time_range(mut self, min: Option<DbTime>, max: Option<DbTime>) -> Result<Self> {
        let range = TimeRange::new(min, max)?;
        if !range.is_unbounded() && self.update_column.is_none() {
            return Err(DiffError::Precondition(format!(
                "a time range on {} requires an update column",
                self.table
            )));
        }
        self.time_range = range;
        Ok(self)
    }

    /// Bound simultaneous queries issued through this segment and every
    /// segment split from it.
    pub fn with_concurrency_budget(mut self, max_queries: usize) -> Self {
        self.budget_size = max_queries.max(1);
        self.budget = Arc::new(Semaphore::new(self.budget_size));
        self
    }

    /// Draw on `other`'s budget when both segments query the same database
    /// handle, so the two sides together stay within its pool.
    pub(crate) fn share_budget_with(mut self, other: &TableSegment) -> Self {
        if Arc::ptr_eq(&self.db, &other.db) {
            self.budget = Arc::clone(&other.budget);
            self.budget_size = other.budget_size;
        }
        self
    }

    pub(crate) fn shares_budget_with(&self, other: &TableSegment) -> bool {
        Arc::ptr_eq(&self.budget, &other.budget)
    }

    pub(crate) fn budget_size(&self) -> usize {
        self.budget_size
    }

    fn check_not_compared(&self, column: &str) -> Result<()> {
        if column == self.key_column {
            return Err(DiffError::Precondition(format!(
                "key column \"{}\" cannot also be a compared column",
                column
            )));
        }
        if self.compared_columns().any(|c| c == column) {
            return Err(DiffError::Precondition(format!(
                "column \"{}\" is listed more than once",
                column
            )));
        }
        Ok(())
    }

    pub fn table(&self) -> &TablePath {
        &self.table
    }

    pub fn key_column(&self) -> &str {
        &self.key_column
    }

    pub fn update_column(&self) -> Option<&str> {
        self.update_column.as_deref()
    }

    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    pub fn time_range(&self) -> &TimeRange {
        &self.time_range
    }

    pub fn db_type(&self) -> &str {
        self.db.db_type()
    }

    /// Compared columns: update column first, then extras.
    pub fn compared_columns(&self) -> impl Iterator<Item = &str> {
        self.update_column
            .as_deref()
            .into_iter()
            .chain(self.extra_columns.iter().map(String::as_str))
    }

    fn query(&self) -> SegmentQuery<'_> {
        SegmentQuery {
            table: &self.table,
            key_column: &self.key_column,
            update_column: self.update_column.as_deref(),
            extra_columns: &self.extra_columns,
            key_range: &self.key_range,
            time_range: &self.time_range,
        }
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>> {
        self.budget.acquire().await.map_err(|_| DiffError::Cancelled)
    }

    /// Validate the named columns and report the key domain.
    pub async fn describe(&self) -> Result<KeyKind> {
        let schema = {
            let _permit = self.permit().await?;
            self.db.describe_table(&self.table).await?
        };
        let table = self.table.to_string();

        let key = schema.require(&table, &self.key_column)?;
        let kind = KeyKind::from_data_type(&key.data_type).ok_or_else(|| {
            DiffError::Schema(format!(
                "key column \"{}\" of {} has type {}, expected an integer, uuid or text type",
                key.name, table, key.data_type
            ))
        })?;

        for bound in [&self.key_range.start, &self.key_range.end].into_iter().flatten() {
            if bound.kind() != kind {
                return Err(DiffError::Precondition(format!(
                    "key bound {} is {} but key column \"{}\" of {} is {}",
                    bound,
                    bound.kind(),
                    self.key_column,
                    table,
                    kind
                )));
            }
        }

        for column in self.compared_columns() {
            schema.require(&table, column)?;
        }

        if let Some(update) = &self.update_column {
            let data_type = schema.data_type(update).unwrap_or_default();
            if !self.time_range.is_unbounded() && !is_date_type(data_type) {
                return Err(DiffError::Schema(format!(
                    "update column \"{}\" of {} has type {}, which cannot be filtered by time",
                    update, table, data_type
                )));
            }
            if is_timezone_naive(data_type) && !self.time_range.is_unbounded() {
                warn!(
                    "{}: time range applied to timezone-naive column \"{}\" ({}); \
                     bounds are interpreted as UTC",
                    table, update, data_type
                );
            }
        }

        debug!("{}: key \"{}\" is {}", table, self.key_column, kind);
        Ok(kind)
    }

    /// Rows within bounds.
    pub async fn count(&self) -> Result<u64> {
        let _permit = self.permit().await?;
        self.db.count(&self.query()).await
    }

    /// Checksum of rows within bounds; [`Checksum::EMPTY`] when there are none.
    pub async fn checksum(&self) -> Result<Checksum> {
        let _permit = self.permit().await?;
        self.db.checksum(&self.query()).await
    }

    /// Count and checksum in one round trip.
    pub async fn count_and_checksum(&self) -> Result<(u64, Checksum)> {
        let _permit = self.permit().await?;
        self.db.count_and_checksum(&self.query()).await
    }

    /// Up to `n - 1` strictly interior, strictly increasing keys that split
    /// this segment's rows into near-equal parts.
    ///
    /// Returns fewer keys when the range holds fewer distinct keys; never a
    /// key equal to the range start, so no returned split leaves an empty
    /// first part.
    pub async fn checkpoints(&self, n: usize) -> Result<Vec<DbKey>> {
        if n < 2 {
            return Err(DiffError::Precondition(format!(
                "checkpoint count must be at least 2, got {}",
                n
            )));
        }
        let raw = {
            let _permit = self.permit().await?;
            self.db.checkpoints(&self.query(), n).await?
        };

        let mut points: Vec<DbKey> = Vec::with_capacity(raw.len());
        for key in raw {
            let increasing = points.last().map_or(true, |last| &key > last);
            if increasing && self.key_range.is_interior(&key) {
                points.push(key);
            }
        }
        Ok(points)
    }

    /// Segment with the same columns and budget over `[start, end)`.
    pub fn sub_range(&self, start: Option<DbKey>, end: Option<DbKey>) -> Result<Self> {
        Ok(Self {
            key_range: KeyRange::new(start, end)?,
            ..self.clone()
        })
    }

    /// Contiguous sub-segments split at `checkpoints`, exactly covering this one.
    ///
    /// Checkpoints must be strictly increasing and strictly interior.
    pub fn split(&self, checkpoints: &[DbKey]) -> Result<Vec<Self>> {
        let mut previous: Option<&DbKey> = None;
        for point in checkpoints {
            if !self.key_range.is_interior(point) || previous.map_or(false, |p| point <= p) {
                return Err(DiffError::Precondition(format!(
                    "checkpoint {} is not strictly increasing inside {}",
                    point, self.key_range
                )));
            }
            previous = Some(point);
        }

        let mut bounds: Vec<Option<DbKey>> = Vec::with_capacity(checkpoints.len() + 2);
        bounds.push(self.key_range.start.clone());
        bounds.extend(checkpoints.iter().cloned().map(Some));
        bounds.push(self.key_range.end.clone());

        bounds
            .windows(2)
            .map(|pair| self.sub_range(pair[0].clone(), pair[1].clone()))
            .collect()
    }

    /// All rows within bounds, ordered by key. The stream keeps one unit of
    /// the query budget until it is dropped.
    pub async fn fetch_rows(&self) -> Result<RowStream> {
        let permit = acquire(&self.budget, 1).await?;
        self.open_fetch(permit).await
    }

    /// Open fetches on both segments for a merge.
    ///
    /// Budget is taken for `a` before `b`, or for both at once when they
    /// share one, so concurrent merges never each hold one side while
    /// waiting for the other.
    pub async fn fetch_pair(a: &TableSegment, b: &TableSegment) -> Result<(RowStream, RowStream)> {
        let (permit_a, permit_b) = if a.shares_budget_with(b) {
            let mut both = acquire(&a.budget, 2).await?;
            let one = both.split(1).ok_or(DiffError::Cancelled)?;
            (both, one)
        } else {
            let permit_a = acquire(&a.budget, 1).await?;
            (permit_a, acquire(&b.budget, 1).await?)
        };
        let rows_a = a.open_fetch(permit_a).await?;
        let rows_b = b.open_fetch(permit_b).await?;
        Ok((rows_a, rows_b))
    }

    async fn open_fetch(&self, permit: OwnedSemaphorePermit) -> Result<RowStream> {
        let rows = self.db.fetch_rows(&self.query()).await?;
        Ok(Box::pin(Permitted {
            rows,
            _permit: permit,
        }))
    }
}

async fn acquire(budget: &Arc<Semaphore>, n: u32) -> Result<OwnedSemaphorePermit> {
    Arc::clone(budget)
        .acquire_many_owned(n)
        .await
        .map_err(|_| DiffError::Cancelled)
}

struct Permitted {
    rows: RowStream,
    _permit: OwnedSemaphorePermit,
}

impl Stream for Permitted {
    type Item = Result<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rows.poll_next_unpin(cx)
    }
}

impl fmt::Debug for TableSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableSegment")
            .field("db", &self.db.db_type())
            .field("table", &self.table.to_string())
            .field("key_column", &self.key_column)
            .field("update_column", &self.update_column)
            .field("extra_columns", &self.extra_columns)
            .field("key_range", &self.key_range)
            .field("time_range", &self.time_range)
            .finish()
    }
}

impl fmt::Display for TableSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.db.db_type(), self.table, self.key_range)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schema::ColumnInfo;
    use crate::core::value::DbValue;
    use crate::drivers::MemoryDatabase;
    use chrono::NaiveDate;

    fn ts(day: u32) -> DbTime {
        NaiveDate::from_ymd_opt(2022, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn memory_db(rows: i64) -> Arc<MemoryDatabase> {
        let db = MemoryDatabase::new();
        db.create_table(
            "ratings",
            vec![
                ColumnInfo::new("id", "bigint", false),
                ColumnInfo::new("updated_at", "timestamp", true),
                ColumnInfo::new("rating", "integer", true),
            ],
        )
        .unwrap();
        db.insert_rows(
            "ratings",
            (1..=rows).map(|id| Row::new(id, vec![ts(1 + (id % 28) as u32).into(), DbValue::Int(id % 5)])),
        )
        .unwrap();
        Arc::new(db)
    }

    fn segment(db: &Arc<MemoryDatabase>) -> TableSegment {
        TableSegment::new(db.clone(), TablePath::parse("ratings").unwrap(), "id")
            .unwrap()
            .with_extra_columns(["rating"])
            .unwrap()
    }

    #[test]
    fn test_rejects_inverted_key_range() {
        let db = memory_db(0);
        let err = segment(&db)
            .with_key_range(Some(DbKey::Int(5)), Some(DbKey::Int(5)))
            .unwrap_err();
        assert!(matches!(err, DiffError::Precondition(_)));
    }

    #[test]
    fn test_rejects_key_as_compared_column() {
        let db = memory_db(0);
        assert!(segment(&db).with_extra_columns(["id"]).is_err());
        assert!(segment(&db).with_update_column("rating").is_err());
    }

    #[test]
    fn test_time_range_requires_update_column() {
        let db = memory_db(0);
        assert!(segment(&db).with_time_range(Some(ts(1)), None).is_err());
        assert!(segment(&db).with_time_range(None, None).is_ok());
        assert!(segment(&db)
            .with_update_column("updated_at")
            .unwrap()
            .with_time_range(Some(ts(2)), Some(ts(1)))
            .is_err());
    }

    #[test]
    fn test_split_covers_parent_exactly() {
        let db = memory_db(0);
        let seg = segment(&db)
            .with_key_range(Some(DbKey::Int(0)), Some(DbKey::Int(100)))
            .unwrap();
        let parts = seg.split(&[DbKey::Int(25), DbKey::Int(50)]).unwrap();
        let ranges: Vec<String> = parts.iter().map(|p| p.key_range().to_string()).collect();
        assert_eq!(ranges, vec!["[0..25)", "[25..50)", "[50..100)"]);
    }

    #[test]
    fn test_split_rejects_non_interior_checkpoints() {
        let db = memory_db(0);
        let seg = segment(&db)
            .with_key_range(Some(DbKey::Int(0)), Some(DbKey::Int(100)))
            .unwrap();
        assert!(seg.split(&[DbKey::Int(0)]).is_err());
        assert!(seg.split(&[DbKey::Int(50), DbKey::Int(40)]).is_err());
        assert!(seg.split(&[DbKey::Int(100)]).is_err());
    }

    #[tokio::test]
    async fn test_boundary_partition_counts_add_up() {
        let db = memory_db(1000);
        let seg = segment(&db);
        let points = seg.checkpoints(8).await.unwrap();
        assert_eq!(points.len(), 7);

        let mut total = 0;
        for part in seg.split(&points).unwrap() {
            let count = part.count().await.unwrap();
            assert!(count > 0);
            total += count;
        }
        assert_eq!(total, seg.count().await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoints_exclude_range_start() {
        let db = memory_db(3);
        let seg = segment(&db)
            .with_key_range(Some(DbKey::Int(1)), None)
            .unwrap();
        let points = seg.checkpoints(32).await.unwrap();
        assert_eq!(points, vec![DbKey::Int(2), DbKey::Int(3)]);

        let single = segment(&memory_db(1));
        assert!(single.checkpoints(32).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_describe_reports_key_kind() {
        let db = memory_db(1);
        assert_eq!(segment(&db).describe().await.unwrap(), KeyKind::Integer);
    }

    #[tokio::test]
    async fn test_describe_rejects_missing_column() {
        let db = memory_db(1);
        let seg = segment(&db).with_extra_columns(["stars"]).unwrap();
        assert!(matches!(seg.describe().await, Err(DiffError::Schema(_))));
    }

    #[tokio::test]
    async fn test_describe_rejects_mismatched_bound_kind() {
        let db = memory_db(1);
        let seg = segment(&db)
            .with_key_range(Some(DbKey::from("a")), None)
            .unwrap();
        assert!(matches!(seg.describe().await, Err(DiffError::Precondition(_))));
    }

    #[tokio::test]
    async fn test_time_range_restricts_rows() {
        let db = memory_db(100);
        let seg = segment(&db)
            .with_update_column("updated_at")
            .unwrap()
            .with_time_range(Some(ts(2)), Some(ts(2)))
            .unwrap();
        // ids with id % 28 == 1
        assert_eq!(seg.count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_budget_bounds_concurrent_queries() {
        let db = Arc::new(
            MemoryDatabase::new().with_latency(std::time::Duration::from_millis(5)),
        );
        db.create_table("t", vec![ColumnInfo::new("id", "bigint", false)])
            .unwrap();
        let seg = TableSegment::new(db.clone(), TablePath::parse("t").unwrap(), "id")
            .unwrap()
            .with_concurrency_budget(2);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let seg = seg.clone();
                tokio::spawn(async move { seg.count().await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(db.peak_in_flight() <= 2);
        assert_eq!(db.query_counts().count, 8);
    }

    #[tokio::test]
    async fn test_open_fetch_holds_budget() {
        let db = memory_db(10);
        let seg = segment(&db).with_concurrency_budget(1);

        let mut rows = seg.fetch_rows().await.unwrap();
        assert!(rows.next().await.is_some());
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(20), seg.count()).await;
        assert!(blocked.is_err());

        drop(rows);
        assert_eq!(seg.count().await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_fetch_pair_on_one_budget_takes_two_units() {
        let db = memory_db(10);
        let a = segment(&db).with_concurrency_budget(3);
        let b = a.clone();
        assert!(a.shares_budget_with(&b));

        let (rows_a, rows_b) = TableSegment::fetch_pair(&a, &b).await.unwrap();
        let open = a.fetch_rows().await.unwrap();
        let blocked = tokio::time::timeout(std::time::Duration::from_millis(20), a.count()).await;
        assert!(blocked.is_err());

        drop((rows_a, rows_b, open));
        assert_eq!(b.count().await.unwrap(), 10);
    }

    #[test]
    fn test_segments_on_one_database_share_a_budget() {
        let db = memory_db(10);
        let a = segment(&db);
        let b = segment(&db);
        assert!(!a.shares_budget_with(&b));
        assert!(b.share_budget_with(&a).shares_budget_with(&a));

        let other = memory_db(10);
        assert!(!segment(&other).share_budget_with(&a).shares_budget_with(&a));
    }
}
