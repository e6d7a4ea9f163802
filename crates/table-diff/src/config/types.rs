//! Configuration type definitions with auto-tuning based on system resources.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::core::identifier::TablePath;
use crate::core::traits::Database;
use crate::core::value::{DbKey, DbTime};
use crate::diff::{
    DiffOptions, DEFAULT_BISECTION_FACTOR, DEFAULT_BISECTION_THRESHOLD, DEFAULT_MAX_WORKERS,
};
use crate::drivers::redact_uri;
use crate::error::Result;
use crate::segment::TableSegment;

/// Connections per side when neither the config nor auto-tuning sets one.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Side A. Rows only here are reported as removed.
    pub source: DatabaseConfig,

    /// Side B. Rows only here are reported as added.
    pub target: DatabaseConfig,

    /// What to compare and how.
    #[serde(default)]
    pub diff: DiffSettings,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.with_resources(&resources)
    }

    pub(crate) fn with_resources(mut self, resources: &SystemResources) -> Self {
        // Workers: one per core, at least 2 and at most 32
        let workers = *self
            .diff
            .max_workers
            .get_or_insert_with(|| resources.cpu_cores.clamp(2, 32));

        // Each running range holds at most one query per side
        for side in [&mut self.source, &mut self.target] {
            side.max_connections
                .get_or_insert_with(|| workers.clamp(2, 64));
        }

        info!(
            "Auto-tuned config: workers={}, source_conns={}, target_conns={}",
            workers,
            self.source.get_max_connections(),
            self.target.get_max_connections()
        );
        self
    }
}

/// One side of the comparison.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URI (`postgres://…`, `mysql://…`).
    pub uri: String,

    /// Table to compare, optionally schema-qualified.
    pub table: String,

    /// Connection pool size. Auto-tuned from workers if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl DatabaseConfig {
    pub fn get_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("uri", &redact_uri(&self.uri))
            .field("table", &self.table)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Segment bounds and differ options shared by both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffSettings {
    /// Unique, totally ordered key column (default: "id").
    #[serde(default = "default_key_column")]
    pub key_column: String,

    /// Column that changes whenever a row changes; compared and time-filtered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_column: Option<String>,

    /// Further compared columns.
    #[serde(default)]
    pub extra_columns: Vec<String>,

    /// Inclusive lower key bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_key: Option<DbKey>,

    /// Exclusive upper key bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_key: Option<DbKey>,

    /// Inclusive lower bound on the update column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_time: Option<DbTime>,

    /// Inclusive upper bound on the update column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_time: Option<DbTime>,

    #[serde(default = "default_bisection_factor")]
    pub bisection_factor: usize,

    #[serde(default = "default_bisection_threshold")]
    pub bisection_threshold: u64,

    #[serde(default = "default_true")]
    pub concurrent: bool,

    /// Ranges compared at once. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
}

impl Default for DiffSettings {
    fn default() -> Self {
        Self {
            key_column: default_key_column(),
            update_column: None,
            extra_columns: Vec::new(),
            start_key: None,
            end_key: None,
            min_time: None,
            max_time: None,
            bisection_factor: DEFAULT_BISECTION_FACTOR,
            bisection_threshold: DEFAULT_BISECTION_THRESHOLD,
            concurrent: true,
            max_workers: None,
        }
    }
}

impl DiffSettings {
    pub fn get_max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }

    /// Differ options from these settings.
    pub fn options(&self) -> DiffOptions {
        DiffOptions {
            bisection_factor: self.bisection_factor,
            bisection_threshold: self.bisection_threshold,
            concurrent: self.concurrent,
            max_workers: self.max_workers,
        }
    }

    /// Segment over `table` on `db` with these columns and bounds.
    pub fn segment(&self, db: Arc<dyn Database>, table: &str) -> Result<TableSegment> {
        let mut segment = TableSegment::new(db, TablePath::parse(table)?, self.key_column.as_str())?;
        if let Some(update) = &self.update_column {
            segment = segment.with_update_column(update.as_str())?;
        }
        segment
            .with_extra_columns(self.extra_columns.iter().map(String::as_str))?
            .with_key_range(self.start_key.clone(), self.end_key.clone())?
            .with_time_range(self.min_time, self.max_time)
    }
}

// Default value functions for serde
fn default_key_column() -> String {
    "id".to_string()
}

fn default_bisection_factor() -> usize {
    DEFAULT_BISECTION_FACTOR
}

fn default_bisection_threshold() -> u64 {
    DEFAULT_BISECTION_THRESHOLD
}

fn default_true() -> bool {
    true
}
