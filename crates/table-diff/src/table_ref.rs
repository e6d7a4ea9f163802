//! Connect-and-diff entry point.

use std::fmt;
use std::sync::Arc;

use crate::config::{DatabaseConfig, DiffSettings, DEFAULT_MAX_CONNECTIONS};
use crate::core::traits::Database;
use crate::diff::{DiffStream, TableDiffer};
use crate::drivers::{connect_to_uri, redact_uri};
use crate::error::Result;
use crate::segment::TableSegment;

/// A table on a database named by URI.
#[derive(Clone, PartialEq, Eq)]
pub struct TableRef {
    pub uri: String,
    pub table: String,
    /// Connection pool size (None = DEFAULT_MAX_CONNECTIONS).
    pub max_connections: Option<usize>,
}

impl TableRef {
    pub fn new(uri: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            table: table.into(),
            max_connections: None,
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// Pool size, sized the same way as a configured side.
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Open a connection pool to this table's database.
    pub async fn connect(&self) -> Result<Arc<dyn Database>> {
        connect_to_uri(&self.uri, self.get_max_connections()).await
    }

    /// Connect and build a segment with `settings`' columns and bounds.
    pub async fn create_segment(&self, settings: &DiffSettings) -> Result<TableSegment> {
        let db = self.connect().await?;
        settings.segment(db, &self.table)
    }
}

impl From<&DatabaseConfig> for TableRef {
    fn from(side: &DatabaseConfig) -> Self {
        Self {
            uri: side.uri.clone(),
            table: side.table.clone(),
            max_connections: side.max_connections,
        }
    }
}

impl fmt::Debug for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRef")
            .field("uri", &redact_uri(&self.uri))
            .field("table", &self.table)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Connect to both tables and start diffing them with identical bounds.
pub async fn diff_tables(a: &TableRef, b: &TableRef, settings: &DiffSettings) -> Result<DiffStream> {
    let differ = TableDiffer::new(settings.options())?;
    let (segment_a, segment_b) = tokio::try_join!(a.create_segment(settings), b.create_segment(settings))?;
    Ok(differ.diff_tables(segment_a, segment_b))
}
