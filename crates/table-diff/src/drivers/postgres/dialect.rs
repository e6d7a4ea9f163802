//! PostgreSQL SQL dialect (Strategy pattern).
//!
//! Provides PostgreSQL-specific identifier quoting, literals, canonical
//! normalization and hashing.

use crate::core::identifier::{quote_pg, TablePath};
use crate::core::schema::{base_type, KeyKind};
use crate::dialect::Dialect;
use crate::error::Result;

/// PostgreSQL dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Create a new PostgreSQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &str {
        "postgres"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_pg(name)
    }

    fn string_literal(&self, value: &str) -> String {
        // standard_conforming_strings is on by default: only quotes need escaping
        format!("'{}'", value.replace('\'', "''"))
    }

    fn normalize_expr(&self, column: &str, data_type: &str) -> String {
        match base_type(data_type).as_str() {
            "boolean" | "bool" => format!("{}::int::text", column),

            "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8" | "serial"
            | "bigserial" | "oid" => format!("{}::text", column),

            "real" | "double precision" | "float4" | "float8" => {
                format!("CAST({} AS NUMERIC(38,6))::text", column)
            }

            "numeric" | "decimal" => format!("{}::text", column),

            "timestamp" | "timestamp without time zone" => {
                format!("to_char({}, 'YYYY-MM-DD HH24:MI:SS.US')", column)
            }
            "timestamptz" | "timestamp with time zone" => format!(
                "to_char({} AT TIME ZONE 'UTC', 'YYYY-MM-DD HH24:MI:SS.US')",
                column
            ),
            "date" => format!("to_char({}, 'YYYY-MM-DD')", column),

            "uuid" => format!("lower({}::text)", column),

            "bytea" => format!("encode({}, 'hex')", column),

            "text" | "character varying" | "varchar" | "character" | "char" | "bpchar" => {
                format!("replace({}::text, E'\\r\\n', E'\\n')", column)
            }

            _ => format!("{}::text", column),
        }
    }

    fn key_text_expr(&self, column: &str, _kind: KeyKind) -> String {
        // fetches decode every column as text, varchar and bpchar keys included
        format!("{}::text", column)
    }

    fn key_order_expr(&self, column: &str, kind: KeyKind) -> String {
        match kind {
            KeyKind::Text => format!("{} COLLATE \"C\"", column),
            KeyKind::Integer | KeyKind::Uuid => column.to_string(),
        }
    }

    fn row_hash_expr(&self, text: &str) -> String {
        format!(
            "('x' || substring(encode(sha256(convert_to({}, 'UTF8')), 'hex') from 50))::bit(60)::bigint",
            text
        )
    }

    fn checksum_aggregate(&self, hash: &str) -> String {
        format!("SUM({})::text", hash)
    }

    fn int_div(&self, lhs: &str, rhs: &str) -> String {
        // both operands are bigint, so / truncates
        format!("({}) / ({})", lhs, rhs)
    }

    fn describe_query(&self, table: &TablePath) -> String {
        let schema = match table.schema() {
            Some(schema) => self.string_literal(schema),
            None => "current_schema()".to_string(),
        };
        let mut sql = format!(
            "SELECT column_name::text, data_type::text, (is_nullable = 'YES') \
             FROM information_schema.columns \
             WHERE table_schema = {} AND table_name = {}",
            schema,
            self.string_literal(table.name())
        );
        if table.parts().len() == 3 {
            sql.push_str(&format!(
                " AND table_catalog = {}",
                self.string_literal(&table.parts()[0])
            ));
        }
        sql.push_str(" ORDER BY ordinal_position");
        sql
    }
}
