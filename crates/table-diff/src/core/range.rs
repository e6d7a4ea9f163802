//! Key and time bounds of a segment.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::value::{DbKey, DbTime};
use crate::error::{DiffError, Result};

/// Half-open key interval `[start, end)`; `None` means unbounded on that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<DbKey>,
    pub end: Option<DbKey>,
}

impl KeyRange {
    /// The unbounded range.
    pub fn all() -> Self {
        Self::default()
    }

    /// Build a range, rejecting `start >= end` and mixed key domains.
    pub fn new(start: Option<DbKey>, end: Option<DbKey>) -> Result<Self> {
        if let (Some(s), Some(e)) = (&start, &end) {
            if s.kind() != e.kind() {
                return Err(DiffError::Precondition(format!(
                    "key range bounds have different types: {} is {}, {} is {}",
                    s,
                    s.kind(),
                    e,
                    e.kind()
                )));
            }
            if s >= e {
                return Err(DiffError::Precondition(format!(
                    "start_key {} must be below end_key {}",
                    s, e
                )));
            }
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, key: &DbKey) -> bool {
        self.start.as_ref().map_or(true, |s| key >= s) && self.end.as_ref().map_or(true, |e| key < e)
    }

    /// Whether `key` lies strictly inside the range (not equal to either bound).
    pub fn is_interior(&self, key: &DbKey) -> bool {
        self.contains(key) && self.start.as_ref() != Some(key)
    }

    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            Some(s) => write!(f, "[{}", s)?,
            None => write!(f, "(-inf")?,
        }
        match &self.end {
            Some(e) => write!(f, "..{})", e),
            None => write!(f, "..+inf)"),
        }
    }
}

/// Closed time interval `[min, max]` applied to the update column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub min: Option<DbTime>,
    pub max: Option<DbTime>,
}

impl TimeRange {
    /// Build a range, rejecting `min > max`.
    pub fn new(min: Option<DbTime>, max: Option<DbTime>) -> Result<Self> {
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(DiffError::Precondition(format!(
                    "min_time {} must not be after max_time {}",
                    lo, hi
                )));
            }
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, ts: &DbTime) -> bool {
        self.min.map_or(true, |lo| *ts >= lo) && self.max.map_or(true, |hi| *ts <= hi)
    }

    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}
