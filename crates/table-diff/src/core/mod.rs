//! Core abstractions shared by segments, dialects and backends.
//!
//! - [`value`]: key and column values with their canonical text
//! - [`checksum`]: the 60-bit SHA-256 row hash and its sum
//! - [`schema`]: column metadata and key domains
//! - [`range`]: key and time bounds
//! - [`identifier`]: table paths and identifier quoting
//! - [`traits`]: the [`Database`] query-execution trait

pub mod checksum;
pub mod identifier;
pub mod range;
pub mod schema;
pub mod traits;
pub mod value;

// Re-export commonly used types for convenience
pub use checksum::Checksum;
pub use identifier::TablePath;
pub use range::{KeyRange, TimeRange};
pub use schema::{ColumnInfo, KeyKind, TableSchema};
pub use traits::{Database, RowStream, SegmentQuery};
pub use value::{DbKey, DbTime, DbValue, Row};
