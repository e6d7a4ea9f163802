//! Query-execution abstraction used by segments.
//!
//! - [`Database`]: one connection pool to one database engine
//! - [`SegmentQuery`]: the slice of a table a single query addresses
//!
//! Segments never build SQL themselves; every aggregate and fetch goes through
//! a [`Database`] implementation, which owns its dialect and its column cache.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;

use super::checksum::Checksum;
use super::identifier::TablePath;
use super::range::{KeyRange, TimeRange};
use super::schema::TableSchema;
use super::value::{DbKey, Row};

/// Rows of one fetch, in key order. Holds its connection until dropped.
pub type RowStream = BoxStream<'static, Result<Row>>;

/// The slice of a table one query addresses.
#[derive(Debug, Clone, Copy)]
pub struct SegmentQuery<'a> {
    /// Table being queried.
    pub table: &'a TablePath,
    /// Bisection key column.
    pub key_column: &'a str,
    /// Optional update column (filtered by `time_range`, compared as content).
    pub update_column: Option<&'a str>,
    /// Additional compared columns, in order.
    pub extra_columns: &'a [String],
    /// Half-open key bounds.
    pub key_range: &'a KeyRange,
    /// Closed bounds on the update column.
    pub time_range: &'a TimeRange,
}

impl<'a> SegmentQuery<'a> {
    /// Compared content columns: the update column first, then extras.
    pub fn compared_columns(&self) -> impl Iterator<Item = &'a str> + 'a {
        self.update_column
            .into_iter()
            .chain(self.extra_columns.iter().map(String::as_str))
    }
}

/// A database reachable through a pool of connections.
///
/// Every method is a single round trip whose result must be internally
/// consistent; no snapshot is shared between calls.
#[async_trait]
pub trait Database: Send + Sync {
    /// Get the database type identifier (e.g., "postgres", "mysql").
    fn db_type(&self) -> &str;

    /// Maximum number of queries this database serves at once.
    fn max_concurrency(&self) -> usize;

    /// Column metadata for a table. Fails with `Schema` if the table is missing.
    async fn describe_table(&self, table: &TablePath) -> Result<TableSchema>;

    /// Row count within the query's bounds.
    async fn count(&self, query: &SegmentQuery<'_>) -> Result<u64>;

    /// Checksum within the query's bounds.
    async fn checksum(&self, query: &SegmentQuery<'_>) -> Result<Checksum>;

    /// Count and checksum in a single round trip.
    async fn count_and_checksum(&self, query: &SegmentQuery<'_>) -> Result<(u64, Checksum)>;

    /// Up to `n - 1` strictly increasing key values tiling the range's rows.
    async fn checkpoints(&self, query: &SegmentQuery<'_>, n: usize) -> Result<Vec<DbKey>>;

    /// All rows within bounds, ordered by key ascending, streamed as the
    /// backend produces them.
    async fn fetch_rows(&self, query: &SegmentQuery<'_>) -> Result<RowStream>;

    /// Close the connection pool.
    async fn close(&self);
}

/// Row positions (1-based) that start each of `n` near-equal tiles of `total` rows.
///
/// Row `rn` opens a new tile when `((rn - 1) * n) / total` exceeds
/// `((rn - 2) * n) / total`; the first row is never returned. SQL backends
/// evaluate the same condition with window functions.
pub fn tile_starts(total: u64, n: usize) -> impl Iterator<Item = u64> {
    let n = n as u128;
    let total_w = total as u128;
    (2..=total).filter(move |&rn| {
        let rn = rn as u128;
        ((rn - 1) * n) / total_w > ((rn - 2) * n) / total_w
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compared_columns_order() {
        let table = TablePath::parse("ratings").unwrap();
        let extras = vec!["rating".to_string(), "comment".to_string()];
        let keys = KeyRange::all();
        let times = TimeRange::default();
        let query = SegmentQuery {
            table: &table,
            key_column: "id",
            update_column: Some("updated_at"),
            extra_columns: &extras,
            key_range: &keys,
            time_range: &times,
        };
        let cols: Vec<&str> = query.compared_columns().collect();
        assert_eq!(cols, vec!["updated_at", "rating", "comment"]);
    }

    #[test]
    fn test_tile_starts_even_split() {
        let starts: Vec<u64> = tile_starts(10, 2).collect();
        assert_eq!(starts, vec![6]);
        let starts: Vec<u64> = tile_starts(100, 4).collect();
        assert_eq!(starts, vec![26, 51, 76]);
    }

    #[test]
    fn test_tile_starts_fewer_rows_than_tiles() {
        let starts: Vec<u64> = tile_starts(3, 32).collect();
        assert_eq!(starts, vec![2, 3]);
        assert_eq!(tile_starts(1, 32).count(), 0);
        assert_eq!(tile_starts(0, 32).count(), 0);
    }
}
