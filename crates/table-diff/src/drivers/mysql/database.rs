//! MySQL/MariaDB backend.
//!
//! Uses SQLx for connection pooling and async query execution. Row fetches
//! are streamed from a reader task through a bounded channel.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row as _;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use crate::core::checksum::Checksum;
use crate::core::identifier::TablePath;
use crate::core::schema::{ColumnInfo, KeyKind, TableSchema};
use crate::core::traits::{Database, RowStream, SegmentQuery};
use crate::core::value::{DbKey, Row};
use crate::dialect::{Dialect, SegmentSql};
use crate::drivers::common::rows::{parse_checksum, parse_key, spawn_reader, text_row};
use crate::error::{DiffError, Result};

use super::MysqlDialect;

const BACKEND: &str = "mysql";

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// MySQL/MariaDB database reachable through a connection pool.
pub struct MysqlDatabase {
    pool: MySqlPool,
    dialect: MysqlDialect,
    max_connections: usize,
    columns: RwLock<HashMap<TablePath, Arc<TableSchema>>>,
}

impl MysqlDatabase {
    /// Connect to a `mysql://` URI and verify the connection.
    ///
    /// Sessions run in UTC so timestamp normalization matches other engines.
    pub async fn connect(uri: &str, max_connections: usize) -> Result<Self> {
        let options = MySqlConnectOptions::from_str(uri)
            .map_err(|e| DiffError::Config(format!("invalid MySQL URI: {}", e)))?
            .timezone(Some("+00:00".to_string()));
        let database = options.get_database().unwrap_or_default().to_string();

        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections as u32)
            .acquire_timeout(POOL_CONNECTION_TIMEOUT)
            .connect_with(options)
            .await?;

        // Test connection
        sqlx::query("SELECT 1").fetch_one(&pool).await?;

        info!(
            "Connected to MySQL database {} (max {} connections)",
            database, max_connections
        );

        Ok(Self {
            pool,
            dialect: MysqlDialect::new(),
            max_connections,
            columns: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_all(&self, sql: &str) -> Result<Vec<MySqlRow>> {
        debug!("{}: {}", BACKEND, sql);
        // literals differ per range, so skip the per-connection statement cache
        Ok(sqlx::query(sql)
            .persistent(false)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn fetch_one(&self, sql: &str) -> Result<MySqlRow> {
        self.fetch_all(sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DiffError::query(BACKEND, "aggregate query returned no rows"))
    }

    /// Column metadata, loaded once per table.
    async fn table_schema(&self, table: &TablePath) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.columns.read().await.get(table) {
            return Ok(Arc::clone(schema));
        }

        let rows = self.fetch_all(&self.dialect.describe_query(table)).await?;
        if rows.is_empty() {
            return Err(DiffError::Schema(format!(
                "table {} does not exist or has no visible columns",
                table
            )));
        }
        let columns = rows
            .iter()
            .map(|row| {
                Ok(ColumnInfo::new(
                    row.try_get::<String, _>(0)?,
                    row.try_get::<String, _>(1)?,
                    row.try_get::<i64, _>(2)? == 1,
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let schema = Arc::new(TableSchema::new(columns));
        debug!("Loaded {} columns for {}", schema.columns.len(), table);

        self.columns
            .write()
            .await
            .insert(table.clone(), Arc::clone(&schema));
        Ok(schema)
    }
}

/// Read every column of a row as optional text.
fn text_fields(row: &MySqlRow) -> Result<Vec<Option<String>>> {
    (0..row.len())
        .map(|i| Ok(row.try_get::<Option<String>, _>(i)?))
        .collect()
}

/// Stream a fetch query's rows into `tx` until they run out or the
/// receiver goes away.
async fn read_rows(
    pool: MySqlPool,
    sql: String,
    kind: KeyKind,
    tx: mpsc::Sender<Result<Row>>,
) -> Result<()> {
    debug!("{}: {}", BACKEND, sql);
    let mut rows = sqlx::query(&sql).persistent(false).fetch(&pool);
    while let Some(row) = rows.try_next().await? {
        let row = text_fields(&row).and_then(|fields| text_row(BACKEND, kind, fields));
        if tx.send(row).await.is_err() {
            debug!("{}: fetch abandoned by its reader", BACKEND);
            break;
        }
    }
    Ok(())
}

#[async_trait]
impl Database for MysqlDatabase {
    fn db_type(&self) -> &str {
        BACKEND
    }

    fn max_concurrency(&self) -> usize {
        self.max_connections
    }

    async fn describe_table(&self, table: &TablePath) -> Result<TableSchema> {
        Ok(self.table_schema(table).await?.as_ref().clone())
    }

    async fn count(&self, query: &SegmentQuery<'_>) -> Result<u64> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?.count()?;
        let row = self.fetch_one(&sql).await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn checksum(&self, query: &SegmentQuery<'_>) -> Result<Checksum> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?.checksum()?;
        let row = self.fetch_one(&sql).await?;
        parse_checksum(BACKEND, row.try_get::<Option<String>, _>(0)?.as_deref())
    }

    async fn count_and_checksum(&self, query: &SegmentQuery<'_>) -> Result<(u64, Checksum)> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?.count_and_checksum()?;
        let row = self.fetch_one(&sql).await?;
        let count = row.try_get::<i64, _>(0)? as u64;
        let checksum = parse_checksum(BACKEND, row.try_get::<Option<String>, _>(1)?.as_deref())?;
        Ok((count, checksum))
    }

    async fn checkpoints(&self, query: &SegmentQuery<'_>, n: usize) -> Result<Vec<DbKey>> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?;
        let kind = sql.key_kind();
        self.fetch_all(&sql.checkpoints(n)?)
            .await?
            .iter()
            .map(|row| parse_key(BACKEND, kind, row.try_get::<Option<String>, _>(0)?.as_deref()))
            .collect()
    }

    async fn fetch_rows(&self, query: &SegmentQuery<'_>) -> Result<RowStream> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?;
        let kind = sql.key_kind();
        let sql = sql.fetch()?;
        let pool = self.pool.clone();
        Ok(spawn_reader(move |tx| read_rows(pool, sql, kind, tx)))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
