//! # table-diff
//!
//! Find the rows that differ between two large tables, possibly on different
//! database engines, without transferring either table in full.
//!
//! The differ splits the shared key space into ranges and compares a row
//! count and an order-independent checksum per range on both sides:
//!
//! - **Pruning**: ranges whose counts and checksums match are skipped
//! - **Bisection**: mismatched ranges are split at checkpoints sampled from
//!   existing keys and compared again
//! - **Leaf comparison**: small ranges are fetched and merged row by row
//! - **Concurrency**: sibling ranges run on a bounded worker pool
//!
//! Backends: PostgreSQL, MySQL/MariaDB and an in-process memory database.
//!
//! ## Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use table_diff::{diff_tables, DiffSettings, TableRef};
//!
//! #[tokio::main]
//! async fn main() -> table_diff::Result<()> {
//!     let settings = DiffSettings {
//!         update_column: Some("updated_at".into()),
//!         extra_columns: vec!["rating".into()],
//!         ..Default::default()
//!     };
//!     let source = TableRef::new("postgres://app@primary/shop", "public.ratings");
//!     let replica = TableRef::new("mysql://app@replica/shop", "ratings");
//!
//!     let mut diff = diff_tables(&source, &replica, &settings).await?;
//!     while let Some(record) = diff.next().await {
//!         println!("{}", record?);
//!     }
//!     println!("{}", diff.stats());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod dialect;
pub mod diff;
pub mod drivers;
pub mod error;
pub mod segment;
pub mod table_ref;

// Re-exports for convenient access
pub use config::{Config, DatabaseConfig, DiffSettings};
pub use crate::core::{Checksum, Database, DbKey, DbTime, DbValue, KeyKind, Row, RowStream, TablePath};
pub use diff::{ColumnChange, DiffOptions, DiffRecord, DiffStats, DiffStream, TableDiffer};
pub use drivers::{connect_to_uri, MemoryDatabase};
pub use error::{DiffError, Result};
pub use segment::TableSegment;
pub use table_ref::{diff_tables, TableRef};
