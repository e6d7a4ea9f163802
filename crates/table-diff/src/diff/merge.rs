//! Merge-walk of two key-ordered row streams.

use std::cmp::Ordering;

use futures::stream::Fuse;
use futures::{StreamExt, TryStreamExt};

use crate::core::traits::RowStream;
use crate::core::value::{DbValue, Row};
use crate::error::Result;

use super::record::{ColumnChange, DiffRecord};

struct Side {
    rows: Fuse<RowStream>,
    head: Option<Row>,
    fetched: u64,
}

impl Side {
    fn new(rows: RowStream) -> Self {
        Self {
            rows: rows.fuse(),
            head: None,
            fetched: 0,
        }
    }

    /// Pull the next row into `head` unless one is already waiting.
    async fn fill(&mut self) -> Result<()> {
        if self.head.is_none() {
            self.head = self.rows.try_next().await?;
            if self.head.is_some() {
                self.fetched += 1;
            }
        }
        Ok(())
    }
}

/// Differences between two row streams, each sorted by key ascending,
/// produced in key order as rows arrive.
///
/// Only the current row of each side is held; `columns` names the compared
/// values of every row, in order.
pub struct RowMerge<'a> {
    a: Side,
    b: Side,
    columns: &'a [String],
}

impl<'a> RowMerge<'a> {
    pub fn new(a: RowStream, b: RowStream, columns: &'a [String]) -> Self {
        Self {
            a: Side::new(a),
            b: Side::new(b),
            columns,
        }
    }

    /// Rows pulled from both sides so far.
    pub fn rows_fetched(&self) -> u64 {
        self.a.fetched + self.b.fetched
    }

    /// The next difference, or `None` once both sides are exhausted.
    pub async fn next_record(&mut self) -> Result<Option<DiffRecord>> {
        loop {
            self.a.fill().await?;
            self.b.fill().await?;

            let order = match (&self.a.head, &self.b.head) {
                (Some(ra), Some(rb)) => ra.key.cmp(&rb.key),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => return Ok(None),
            };
            match order {
                Ordering::Less => {
                    if let Some(row) = self.a.head.take() {
                        return Ok(Some(DiffRecord::Removed {
                            key: row.key,
                            values: row.values,
                        }));
                    }
                }
                Ordering::Greater => {
                    if let Some(row) = self.b.head.take() {
                        return Ok(Some(DiffRecord::Added {
                            key: row.key,
                            values: row.values,
                        }));
                    }
                }
                Ordering::Equal => {
                    if let (Some(ra), Some(rb)) = (self.a.head.take(), self.b.head.take()) {
                        if let Some(record) = compare_pair(ra, rb, self.columns) {
                            return Ok(Some(record));
                        }
                    }
                }
            }
        }
    }
}

fn compare_pair(a: Row, b: Row, columns: &[String]) -> Option<DiffRecord> {
    if a.values == b.values {
        return None;
    }
    let width = a.values.len().max(b.values.len());
    let changes = (0..width)
        .filter_map(|i| {
            let va = a.values.get(i).cloned().unwrap_or(DbValue::Null);
            let vb = b.values.get(i).cloned().unwrap_or(DbValue::Null);
            (va != vb).then(|| ColumnChange {
                column: columns.get(i).cloned().unwrap_or_else(|| format!("#{}", i + 1)),
                a: va,
                b: vb,
            })
        })
        .collect();
    Some(DiffRecord::Changed {
        key: a.key,
        a: a.values,
        b: b.values,
        changes,
    })
}
