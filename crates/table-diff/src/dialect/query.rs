//! Segment query builders shared by the SQL backends.

use crate::core::checksum::{LENGTH_END, NULL_FIELD, VALUE_TAG};
use crate::core::schema::{KeyKind, TableSchema};
use crate::core::traits::SegmentQuery;
use crate::error::{DiffError, Result};

use super::Dialect;

/// Builds the SQL for one segment query against one table.
///
/// Construction validates the named columns against the table's metadata, so
/// a missing column surfaces as `Schema` before any SQL is sent.
pub struct SegmentSql<'a, D: Dialect + ?Sized> {
    dialect: &'a D,
    query: SegmentQuery<'a>,
    schema: &'a TableSchema,
    key_kind: KeyKind,
}

impl<'a, D: Dialect + ?Sized> SegmentSql<'a, D> {
    pub fn new(dialect: &'a D, query: SegmentQuery<'a>, schema: &'a TableSchema) -> Result<Self> {
        let table = query.table.to_string();
        let key = schema.require(&table, query.key_column)?;
        let key_kind = KeyKind::from_data_type(&key.data_type).ok_or_else(|| {
            DiffError::Schema(format!(
                "key column \"{}\" of {} has type {}, expected an integer, uuid or text type",
                key.name, table, key.data_type
            ))
        })?;
        for column in query.compared_columns() {
            schema.require(&table, column)?;
        }

        Ok(Self {
            dialect,
            query,
            schema,
            key_kind,
        })
    }

    pub fn key_kind(&self) -> KeyKind {
        self.key_kind
    }

    fn key_order(&self) -> Result<String> {
        let key = self.dialect.quote_ident(self.query.key_column)?;
        Ok(self.dialect.key_order_expr(&key, self.key_kind))
    }

    fn key_text(&self) -> Result<String> {
        let key = self.dialect.quote_ident(self.query.key_column)?;
        Ok(self.dialect.key_text_expr(&key, self.key_kind))
    }

    /// Normalized expressions of the compared columns, in order.
    fn compared_exprs(&self) -> Result<Vec<String>> {
        self.query
            .compared_columns()
            .map(|name| {
                let data_type = self.schema.data_type(name).unwrap_or_default();
                let column = self.dialect.quote_ident(name)?;
                Ok(self.dialect.normalize_expr(&column, data_type))
            })
            .collect()
    }

    /// `FROM <table> [WHERE <key and time bounds>]`
    pub fn from_where(&self) -> Result<String> {
        let mut conditions = Vec::new();

        let range = self.query.key_range;
        if range.start.is_some() || range.end.is_some() {
            let key = self.key_order()?;
            if let Some(start) = &range.start {
                conditions.push(format!("{} >= {}", key, self.dialect.key_literal(start)));
            }
            if let Some(end) = &range.end {
                conditions.push(format!("{} < {}", key, self.dialect.key_literal(end)));
            }
        }

        let times = self.query.time_range;
        if let Some(update) = self.query.update_column {
            let column = self.dialect.quote_ident(update)?;
            if let Some(min) = &times.min {
                conditions.push(format!("{} >= {}", column, self.dialect.time_literal(min)));
            }
            if let Some(max) = &times.max {
                conditions.push(format!("{} <= {}", column, self.dialect.time_literal(max)));
            }
        }

        let mut sql = format!("FROM {}", self.dialect.quote_table(self.query.table)?);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        Ok(sql)
    }

    /// One length-prefixed field of the hashed row text.
    fn encoded_field(&self, expr: &str) -> String {
        format!(
            "CASE WHEN {e} IS NULL THEN {null} ELSE CONCAT({tag}, CHAR_LENGTH({e}), {end}, {e}) END",
            e = expr,
            null = self.dialect.string_literal(NULL_FIELD),
            tag = self.dialect.string_literal(VALUE_TAG),
            end = self.dialect.string_literal(LENGTH_END),
        )
    }

    /// Hash expression over the encoded key and compared columns.
    fn row_hash(&self) -> Result<String> {
        let mut fields = vec![self.encoded_field(&self.key_text()?)];
        for expr in self.compared_exprs()? {
            fields.push(self.encoded_field(&expr));
        }
        let text = format!("CONCAT({})", fields.join(", "));
        Ok(self.dialect.row_hash_expr(&text))
    }

    pub fn count_and_checksum(&self) -> Result<String> {
        Ok(format!(
            "SELECT COUNT(*), {} {}",
            self.dialect.checksum_aggregate(&self.row_hash()?),
            self.from_where()?
        ))
    }

    pub fn count(&self) -> Result<String> {
        Ok(format!("SELECT COUNT(*) {}", self.from_where()?))
    }

    pub fn checksum(&self) -> Result<String> {
        Ok(format!(
            "SELECT {} {}",
            self.dialect.checksum_aggregate(&self.row_hash()?),
            self.from_where()?
        ))
    }

    /// Key values opening each of `n` near-equal row tiles, first tile excluded.
    pub fn checkpoints(&self, n: usize) -> Result<String> {
        let current = self.dialect.int_div(&format!("(rn - 1) * {}", n), "total");
        let previous = self.dialect.int_div(&format!("(rn - 2) * {}", n), "total");
        Ok(format!(
            "SELECT k FROM (SELECT {} AS k, ROW_NUMBER() OVER (ORDER BY {}) AS rn, \
             COUNT(*) OVER () AS total {}) tiles \
             WHERE rn > 1 AND {} > {} ORDER BY rn",
            self.key_text()?,
            self.key_order()?,
            self.from_where()?,
            current,
            previous
        ))
    }

    /// Key plus normalized compared columns, ordered by key.
    pub fn fetch(&self) -> Result<String> {
        let mut columns = vec![self.key_text()?];
        columns.extend(self.compared_exprs()?);
        Ok(format!(
            "SELECT {} {} ORDER BY {}",
            columns.join(", "),
            self.from_where()?,
            self.key_order()?
        ))
    }
}
