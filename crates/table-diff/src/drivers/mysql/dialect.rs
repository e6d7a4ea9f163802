//! MySQL/MariaDB SQL dialect (Strategy pattern).
//!
//! Compatible with MySQL 8.0+ and MariaDB 10.2+ (window functions are
//! required for checkpoint tiling).

use crate::core::identifier::{quote_mysql, TablePath};
use crate::core::schema::{base_type, KeyKind};
use crate::dialect::Dialect;
use crate::error::Result;

/// CRLF and LF built without backslash escapes, so NO_BACKSLASH_ESCAPES does not matter.
const CRLF: &str = "CONCAT(CHAR(13 USING utf8mb4), CHAR(10 USING utf8mb4))";
const LF: &str = "CHAR(10 USING utf8mb4)";

/// MySQL/MariaDB dialect implementation.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    /// Create a new MySQL dialect instance.
    pub fn new() -> Self {
        Self
    }
}

impl Dialect for MysqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    fn quote_ident(&self, name: &str) -> Result<String> {
        quote_mysql(name)
    }

    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
    }

    fn normalize_expr(&self, column: &str, data_type: &str) -> String {
        match base_type(data_type).as_str() {
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "bit"
            | "bool" | "boolean" => format!("CAST({} + 0 AS CHAR)", column),

            "float" | "double" | "real" => {
                format!("CAST(CAST({} AS DECIMAL(38,6)) AS CHAR)", column)
            }

            "decimal" | "numeric" => format!("CAST({} AS CHAR)", column),

            "datetime" | "timestamp" => {
                format!("DATE_FORMAT({}, '%Y-%m-%d %H:%i:%s.%f')", column)
            }
            "date" => format!("DATE_FORMAT({}, '%Y-%m-%d')", column),

            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" => {
                format!("LOWER(HEX({}))", column)
            }

            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" => {
                format!("REPLACE({}, {}, {})", column, CRLF, LF)
            }

            _ => format!("CAST({} AS CHAR)", column),
        }
    }

    fn key_text_expr(&self, column: &str, kind: KeyKind) -> String {
        match kind {
            KeyKind::Integer => format!("CAST({} AS CHAR)", column),
            KeyKind::Uuid => format!("LOWER({})", column),
            KeyKind::Text => column.to_string(),
        }
    }

    fn key_order_expr(&self, column: &str, kind: KeyKind) -> String {
        match kind {
            KeyKind::Text | KeyKind::Uuid => format!("CAST({} AS BINARY)", column),
            KeyKind::Integer => column.to_string(),
        }
    }

    fn row_hash_expr(&self, text: &str) -> String {
        format!(
            "CAST(CONV(SUBSTRING(SHA2({}, 256), 50), 16, 10) AS UNSIGNED)",
            text
        )
    }

    fn checksum_aggregate(&self, hash: &str) -> String {
        format!("CAST(SUM({}) AS CHAR)", hash)
    }

    fn int_div(&self, lhs: &str, rhs: &str) -> String {
        format!("({}) DIV ({})", lhs, rhs)
    }

    fn describe_query(&self, table: &TablePath) -> String {
        let schema = match table.schema() {
            Some(schema) => self.string_literal(schema),
            None => "DATABASE()".to_string(),
        };
        format!(
            "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR), \
             CAST(IS_NULLABLE = 'YES' AS SIGNED) \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} \
             ORDER BY ORDINAL_POSITION",
            schema,
            self.string_literal(table.name())
        )
    }
}
