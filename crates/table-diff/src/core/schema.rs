//! Column metadata and key domains.
//!
//! Backends report column metadata through [`TableSchema`], which the diff
//! uses to validate the configured columns before any range query runs.

use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};

/// The totally ordered domain of a key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Integer,
    Uuid,
    Text,
}

impl KeyKind {
    /// Classify a column data type as a key domain.
    ///
    /// Returns `None` for types that cannot serve as a bisection key.
    pub fn from_data_type(data_type: &str) -> Option<Self> {
        let base = base_type(data_type);
        if is_integer_type(&base) {
            Some(KeyKind::Integer)
        } else if base == "uuid" || base == "uniqueidentifier" {
            Some(KeyKind::Uuid)
        } else if is_text_type(&base) {
            Some(KeyKind::Text)
        } else {
            None
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyKind::Integer => "integer",
            KeyKind::Uuid => "uuid",
            KeyKind::Text => "text",
        };
        f.write_str(name)
    }
}

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Data type as reported by the database (e.g., "bigint", "character varying").
    pub data_type: String,

    /// Whether the column allows NULL.
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, is_nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_nullable,
        }
    }
}

/// Columns of one table, in ordinal order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnInfo>) -> Self {
        Self { columns }
    }

    /// Find a column by exact name.
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Find a column by exact name, or fail with a `Schema` error naming the table.
    ///
    /// When only a case-insensitive match exists it is suggested in the message,
    /// since identifiers are always quoted in generated queries.
    pub fn require(&self, table: &str, name: &str) -> Result<&ColumnInfo> {
        if let Some(col) = self.column(name) {
            return Ok(col);
        }
        let hint = self
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
            .map(|c| format!(" (did you mean \"{}\"?)", c.name))
            .unwrap_or_default();
        Err(DiffError::Schema(format!(
            "column \"{}\" does not exist in table {}{}",
            name, table, hint
        )))
    }

    /// Data type of a column, if present.
    pub fn data_type(&self, name: &str) -> Option<&str> {
        self.column(name).map(|c| c.data_type.as_str())
    }
}

/// Strip length/precision and MySQL sign modifiers and lowercase:
/// `varchar(36)` → `varchar`, `bigint(20) unsigned` → `bigint`.
pub fn base_type(data_type: &str) -> String {
    let mut base = data_type.trim().to_lowercase();
    if let Some(idx) = base.find('(') {
        base.truncate(idx);
    }
    for modifier in [" zerofill", " unsigned", " signed"] {
        if let Some(stripped) = base.trim_end().strip_suffix(modifier) {
            base = stripped.to_string();
        }
    }
    base.trim_end().to_string()
}

pub fn is_integer_type(base: &str) -> bool {
    matches!(
        base,
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "int2" | "int4"
            | "int8" | "serial" | "bigserial"
    )
}

pub fn is_text_type(base: &str) -> bool {
    matches!(
        base,
        "text"
            | "varchar"
            | "char"
            | "character varying"
            | "character"
            | "bpchar"
            | "tinytext"
            | "mediumtext"
            | "longtext"
    )
}

/// Check if a data type is a date/time type usable as an update column.
pub fn is_date_type(data_type: &str) -> bool {
    matches!(
        base_type(data_type).as_str(),
        "datetime"
            | "date"
            | "timestamp"
            | "timestamptz"
            | "timestamp with time zone"
            | "timestamp without time zone"
    )
}

/// Check if a timestamp type is timezone-naive (lacks timezone info).
pub fn is_timezone_naive(data_type: &str) -> bool {
    matches!(
        base_type(data_type).as_str(),
        "datetime" | "timestamp" | "timestamp without time zone"
    )
}
