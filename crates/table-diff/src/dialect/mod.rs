//! SQL dialects and segment query generation.
//!
//! A [`Dialect`] supplies the engine-specific pieces (quoting, literals,
//! per-type normalization, hashing, integer division). [`SegmentSql`] combines
//! them into the handful of queries a segment needs:
//!
//! - count and checksum, in one round trip
//! - checkpoints, by ROW_NUMBER tiling
//! - ordered row fetch
//!
//! Every normalization expression produces the canonical text documented in
//! [`crate::core::value`], so hashes computed by different engines agree.

mod query;

pub use query::SegmentSql;

use crate::core::identifier::TablePath;
use crate::core::schema::KeyKind;
use crate::core::value::{DbKey, DbTime, TIMESTAMP_FORMAT};
use crate::error::Result;

/// SQL syntax strategy for one database engine.
pub trait Dialect: Send + Sync {
    /// Get the dialect identifier (e.g., "postgres", "mysql").
    fn name(&self) -> &str;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_ident(&self, name: &str) -> Result<String>;

    /// Quote a possibly qualified table path.
    fn quote_table(&self, table: &TablePath) -> Result<String> {
        table.qualified(|part| self.quote_ident(part))
    }

    /// Render a string literal.
    fn string_literal(&self, value: &str) -> String;

    /// Render a key value as a literal comparable with the key column.
    fn key_literal(&self, key: &DbKey) -> String {
        match key {
            DbKey::Int(v) => v.to_string(),
            DbKey::Uuid(v) => self.string_literal(&v.to_string()),
            DbKey::Text(v) => self.string_literal(v),
        }
    }

    /// Render a timestamp literal for update-column bounds.
    fn time_literal(&self, ts: &DbTime) -> String {
        self.string_literal(&ts.format(TIMESTAMP_FORMAT).to_string())
    }

    /// Expression producing the canonical text of a column, NULL for NULL.
    fn normalize_expr(&self, column: &str, data_type: &str) -> String;

    /// Expression producing the canonical text of the key column.
    fn key_text_expr(&self, column: &str, kind: KeyKind) -> String;

    /// Expression the key column is compared and ordered by.
    ///
    /// Text keys are compared bytewise so every engine agrees on the order.
    fn key_order_expr(&self, column: &str, kind: KeyKind) -> String;

    /// 60-bit integer hash of a text expression (last 15 hex digits of SHA-256).
    fn row_hash_expr(&self, text: &str) -> String;

    /// Text-typed `SUM` of row hashes.
    fn checksum_aggregate(&self, hash: &str) -> String;

    /// Integer division.
    fn int_div(&self, lhs: &str, rhs: &str) -> String;

    /// Catalog query returning `(column_name, data_type, is_nullable)` rows.
    fn describe_query(&self, table: &TablePath) -> String;
}
