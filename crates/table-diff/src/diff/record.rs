//! Difference records yielded by a diff.

use std::fmt;

use serde::Serialize;

use crate::core::value::{DbKey, DbValue};

/// One compared column whose value differs between the two sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnChange {
    pub column: String,
    pub a: DbValue,
    pub b: DbValue,
}

/// A row-level difference between side A and side B.
///
/// Values are the compared columns (update column first, then extra columns).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiffRecord {
    /// Row present only in A.
    Removed { key: DbKey, values: Vec<DbValue> },
    /// Row present only in B.
    Added { key: DbKey, values: Vec<DbValue> },
    /// Row present on both sides with differing content.
    Changed {
        key: DbKey,
        a: Vec<DbValue>,
        b: Vec<DbValue>,
        changes: Vec<ColumnChange>,
    },
}

impl DiffRecord {
    pub fn key(&self) -> &DbKey {
        match self {
            DiffRecord::Removed { key, .. }
            | DiffRecord::Added { key, .. }
            | DiffRecord::Changed { key, .. } => key,
        }
    }

    /// `-` for removed, `+` for added, `~` for changed.
    pub fn sign(&self) -> char {
        match self {
            DiffRecord::Removed { .. } => '-',
            DiffRecord::Added { .. } => '+',
            DiffRecord::Changed { .. } => '~',
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, DiffRecord::Changed { .. })
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[DbValue]) -> fmt::Result {
    if values.is_empty() {
        return Ok(());
    }
    write!(f, " (")?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", value)?;
    }
    write!(f, ")")
}

impl fmt::Display for DiffRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.sign(), self.key())?;
        match self {
            DiffRecord::Removed { values, .. } | DiffRecord::Added { values, .. } => {
                write_values(f, values)
            }
            DiffRecord::Changed { changes, .. } => {
                for change in changes {
                    write!(f, " {}: {} -> {}", change.column, change.a, change.b)?;
                }
                Ok(())
            }
        }
    }
}
