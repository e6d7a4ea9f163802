//! Error types for the diff library.

use thiserror::Error;

/// Exit code for configuration errors (invalid YAML, bad options, bad segments).
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for connectivity failures.
pub const EXIT_CONNECTIVITY_ERROR: u8 = 2;
/// Exit code for schema errors (missing columns, incomparable keys).
pub const EXIT_SCHEMA_ERROR: u8 = 3;
/// Exit code for query execution failures.
pub const EXIT_QUERY_ERROR: u8 = 4;
/// Exit code when the diff was cancelled.
pub const EXIT_CANCELLED: u8 = 5;
/// Exit code for serialization and other internal errors.
pub const EXIT_INTERNAL_ERROR: u8 = 6;
/// Exit code for file system errors.
pub const EXIT_IO_ERROR: u8 = 7;

/// Main error type for diff operations.
#[derive(Error, Debug)]
pub enum DiffError {
    /// Configuration error (invalid YAML, missing fields, unsupported URI, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The query could not be executed (pool, socket, TLS, server gone).
    ///
    /// Retrying is the caller's decision; the engine never retries.
    #[error("Connection error ({backend}): {message}")]
    Connectivity { backend: String, message: String },

    /// Named column or table missing, or key types incomparable between sides.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The server rejected or failed a query for a non-schema reason.
    #[error("Query failed ({backend}): {message}")]
    Query { backend: String, message: String },

    /// Malformed segment (start >= end, invalid identifiers, etc.)
    #[error("Invalid segment: {0}")]
    Precondition(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Diff was cancelled (consumer dropped the stream, SIGINT, etc.)
    #[error("Diff cancelled")]
    Cancelled,

    /// A range worker panicked.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DiffError {
    /// Create a Connectivity error for the given backend.
    pub fn connectivity(backend: impl Into<String>, message: impl ToString) -> Self {
        DiffError::Connectivity {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Create a Query error for the given backend.
    pub fn query(backend: impl Into<String>, message: impl ToString) -> Self {
        DiffError::Query {
            backend: backend.into(),
            message: message.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the whole diff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiffError::Connectivity { .. })
    }

    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            DiffError::Config(_) | DiffError::Yaml(_) | DiffError::Precondition(_) => {
                EXIT_CONFIG_ERROR
            }
            DiffError::Connectivity { .. } => EXIT_CONNECTIVITY_ERROR,
            DiffError::Schema(_) => EXIT_SCHEMA_ERROR,
            DiffError::Query { .. } => EXIT_QUERY_ERROR,
            DiffError::Cancelled => EXIT_CANCELLED,
            DiffError::Json(_) | DiffError::Internal(_) => EXIT_INTERNAL_ERROR,
            DiffError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// SQLSTATE class 42 covers syntax errors and undefined tables/columns.
fn is_schema_sqlstate(code: &str) -> bool {
    code.starts_with("42")
}

impl From<tokio_postgres::Error> for DiffError {
    fn from(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) if is_schema_sqlstate(db.code().code()) => {
                DiffError::Schema(db.message().to_string())
            }
            Some(db) => DiffError::query("postgres", db.message()),
            None => DiffError::connectivity("postgres", err),
        }
    }
}

impl From<deadpool_postgres::PoolError> for DiffError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        DiffError::connectivity("postgres", format!("acquiring pooled connection: {}", err))
    }
}

impl From<sqlx::Error> for DiffError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => match db.code() {
                Some(code) if is_schema_sqlstate(&code) => DiffError::Schema(db.message().to_string()),
                _ => DiffError::query("mysql", db.message()),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => DiffError::connectivity("mysql", err),
            sqlx::Error::Configuration(_) => DiffError::Config(err.to_string()),
            sqlx::Error::ColumnNotFound(name) => {
                DiffError::Schema(format!("column not found in result: {}", name))
            }
            _ => DiffError::query("mysql", err),
        }
    }
}

impl From<tokio::task::JoinError> for DiffError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            DiffError::Cancelled
        } else {
            DiffError::Internal(format!("range worker failed: {}", err))
        }
    }
}

/// Result type alias for diff operations.
pub type Result<T> = std::result::Result<T, DiffError>;
