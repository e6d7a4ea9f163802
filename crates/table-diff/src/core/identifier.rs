//! Table identifiers and SQL identifier quoting.
//!
//! SQL identifiers (table names, column names, schema names) cannot be passed
//! as parameters in prepared statements, so every identifier that ends up in a
//! generated query goes through this module:
//!
//! 1. Validate identifiers for suspicious patterns (null bytes, excessive length)
//! 2. Apply database-specific quoting (double quotes, backticks)
//! 3. Escape the quote character within the identifier
//!
//! [`TablePath`] is the parsed form of the `"schema.table"` strings users pass
//! on the command line and in configuration files.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DiffError, Result};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - MySQL: 64 characters
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Maximum number of dot-separated parts in a table path (`db.schema.table`).
const MAX_PATH_PARTS: usize = 3;

/// Validate an identifier for security issues.
///
/// Rejects:
/// - Empty identifiers
/// - Identifiers containing null bytes (injection vector)
/// - Identifiers exceeding maximum length
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DiffError::Precondition(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(DiffError::Precondition(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(DiffError::Precondition(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
///
/// Escapes double quotes by doubling them and wraps in double quotes.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
///
/// Escapes backticks by doubling them and wraps in backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// A possibly schema-qualified table name.
///
/// Parts are stored unquoted, outermost first: `["public", "ratings"]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TablePath {
    parts: Vec<String>,
}

impl TablePath {
    /// Build a path from already-split parts.
    pub fn new<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        if parts.is_empty() || parts.len() > MAX_PATH_PARTS {
            return Err(DiffError::Precondition(format!(
                "Table path must have 1 to {} parts, got {}",
                MAX_PATH_PARTS,
                parts.len()
            )));
        }
        for part in &parts {
            validate_identifier(part)?;
        }
        Ok(Self { parts })
    }

    /// Parse a `"schema.table"` style name.
    ///
    /// Double-quoted parts may contain dots; `""` inside quotes is a literal quote.
    pub fn parse(name: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = name.trim().chars().peekable();
        let mut in_quotes = false;

        while let Some(c) = chars.next() {
            match c {
                '"' if in_quotes && chars.peek() == Some(&'"') => {
                    chars.next();
                    current.push('"');
                }
                '"' => in_quotes = !in_quotes,
                '.' if !in_quotes => parts.push(std::mem::take(&mut current)),
                _ => current.push(c),
            }
        }

        if in_quotes {
            return Err(DiffError::Precondition(format!(
                "Unterminated quote in table name: {:?}",
                name
            )));
        }
        parts.push(current);

        Self::new(parts)
    }

    /// The unqualified table name (last part).
    pub fn name(&self) -> &str {
        // parts is never empty, enforced by `new`
        self.parts.last().map(String::as_str).unwrap_or_default()
    }

    /// The schema (or database, for MySQL) part, if qualified.
    pub fn schema(&self) -> Option<&str> {
        if self.parts.len() >= 2 {
            Some(&self.parts[self.parts.len() - 2])
        } else {
            None
        }
    }

    /// All parts, outermost first.
    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// Render the path with the given quoting function, joined by dots.
    pub fn qualified(&self, quote: impl Fn(&str) -> Result<String>) -> Result<String> {
        let quoted = self
            .parts
            .iter()
            .map(|p| quote(p.as_str()))
            .collect::<Result<Vec<_>>>()?;
        Ok(quoted.join("."))
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .parts
            .iter()
            .map(|p| {
                if p.contains('.') || p.contains('"') {
                    format!("\"{}\"", p.replace('"', "\"\""))
                } else {
                    p.clone()
                }
            })
            .collect();
        write!(f, "{}", rendered.join("."))
    }
}

impl std::str::FromStr for TablePath {
    type Err = DiffError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TablePath {
    type Error = DiffError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<TablePath> for String {
    fn from(path: TablePath) -> Self {
        path.to_string()
    }
}
