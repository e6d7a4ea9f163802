//! Database driver implementations.
//!
//! - [`postgres`]: PostgreSQL dialect and pooled backend
//! - [`mysql`]: MySQL/MariaDB dialect and pooled backend
//! - [`memory`]: in-process backend
//! - [`common`]: shared utilities (TLS, text row decoding)
//!
//! [`connect_to_uri`] picks the backend from the URI scheme.

pub mod common;
pub mod memory;
pub mod mysql;
pub mod postgres;

use std::sync::Arc;

pub use memory::{MemoryDatabase, QueryCounts};
pub use mysql::{MysqlDatabase, MysqlDialect};
pub use postgres::{PgDatabase, PostgresDialect};

use tracing::debug;

use crate::core::traits::Database;
use crate::dialect::Dialect;
use crate::error::{DiffError, Result};

/// The SQL dialect a connection URI or type name selects.
#[derive(Debug, Clone)]
pub enum DialectImpl {
    Postgres(PostgresDialect),
    Mysql(MysqlDialect),
}

impl DialectImpl {
    /// Create a dialect implementation from a database type string.
    pub fn from_db_type(db_type: &str) -> Result<Self> {
        match db_type.to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(DialectImpl::Postgres(PostgresDialect::new())),
            "mysql" | "mariadb" => Ok(DialectImpl::Mysql(MysqlDialect::new())),
            other => Err(DiffError::Config(format!(
                "Unknown database type: '{}'. Supported types: postgres, mysql",
                other
            ))),
        }
    }

    /// Pick the dialect for a connection URI by its scheme.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| {
                DiffError::Config(format!(
                    "Connection URI must start with a scheme such as postgres:// or mysql://, got {:?}",
                    redact_uri(uri)
                ))
            })?;
        Self::from_db_type(scheme)
    }

    pub fn name(&self) -> &str {
        match self {
            DialectImpl::Postgres(d) => d.name(),
            DialectImpl::Mysql(d) => d.name(),
        }
    }
}

/// Connect to the database named by `uri`.
///
/// Supported schemes: `postgres://`, `postgresql://`, `mysql://`, `mariadb://`.
pub async fn connect_to_uri(uri: &str, max_connections: usize) -> Result<Arc<dyn Database>> {
    if max_connections == 0 {
        return Err(DiffError::Config("max_connections must be at least 1".into()));
    }
    let dialect = DialectImpl::from_uri(uri)?;
    debug!("Connecting to {} at {}", dialect.name(), redact_uri(uri));
    let db: Arc<dyn Database> = match dialect {
        DialectImpl::Postgres(_) => Arc::new(PgDatabase::connect(uri, max_connections).await?),
        DialectImpl::Mysql(_) => {
            // sqlx only understands the mysql:// scheme
            let uri = match uri.strip_prefix("mariadb://") {
                Some(rest) => format!("mysql://{}", rest),
                None => uri.to_string(),
            };
            Arc::new(MysqlDatabase::connect(&uri, max_connections).await?)
        }
    };
    Ok(db)
}

/// Replace the password in a connection URI with `***`.
pub fn redact_uri(uri: &str) -> String {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    match authority.rfind('@') {
        Some(at) => {
            let (userinfo, host) = authority.split_at(at);
            match userinfo.split_once(':') {
                Some((user, _)) => format!("{}://{}:***{}{}", scheme, user, host, path),
                None => uri.to_string(),
            }
        }
        None => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_impl_from_db_type() {
        assert_eq!(DialectImpl::from_db_type("postgres").unwrap().name(), "postgres");
        assert_eq!(DialectImpl::from_db_type("MySQL").unwrap().name(), "mysql");
        assert!(DialectImpl::from_db_type("pg").is_ok());
        assert!(DialectImpl::from_db_type("mariadb").is_ok());
        assert!(DialectImpl::from_db_type("oracle").is_err());
    }

    #[test]
    fn test_dialect_impl_from_uri() {
        let dialect = DialectImpl::from_uri("postgresql://u:p@localhost/app").unwrap();
        assert!(matches!(dialect, DialectImpl::Postgres(_)));

        let dialect = DialectImpl::from_uri("mariadb://localhost/app").unwrap();
        assert!(matches!(dialect, DialectImpl::Mysql(_)));
        assert_eq!(dialect.name(), "mysql");

        let err = DialectImpl::from_uri("sqlite://file.db").unwrap_err();
        assert!(matches!(err, DiffError::Config(_)));
        assert!(DialectImpl::from_uri("not a uri").is_err());
    }

    #[test]
    fn test_redact_uri() {
        assert_eq!(
            redact_uri("postgres://admin:s3cret@db:5432/app"),
            "postgres://admin:***@db:5432/app"
        );
        assert_eq!(redact_uri("mysql://root@db/app"), "mysql://root@db/app");
        assert_eq!(redact_uri("postgres://db/app"), "postgres://db/app");
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let err = connect_to_uri("oracle://db/app", 4).await.err().unwrap();
        assert_eq!(err.exit_code(), crate::error::EXIT_CONFIG_ERROR);
    }
}
