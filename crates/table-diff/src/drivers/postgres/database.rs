//! PostgreSQL backend.
//!
//! Uses deadpool-postgres for connection pooling. Aggregates are sent
//! through the simple query protocol: every selected value is already text,
//! and each aggregate costs a single round trip. Row fetches are streamed
//! from a reader task that holds its pooled connection until the stream is
//! done or dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use futures::TryStreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_postgres::{Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use crate::core::checksum::Checksum;
use crate::core::identifier::TablePath;
use crate::core::schema::{ColumnInfo, KeyKind, TableSchema};
use crate::core::traits::{Database, RowStream, SegmentQuery};
use crate::core::value::{DbKey, Row};
use crate::dialect::{Dialect, SegmentSql};
use crate::drivers::common::rows::{parse_checksum, parse_count, parse_key, spawn_reader, text_row};
use crate::drivers::common::{make_tls_connector, SslMode};
use crate::error::{DiffError, Result};

use super::PostgresDialect;

const BACKEND: &str = "postgres";

/// Connection timeout used when the URI does not set one.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Session settings applied to every pooled connection.
const SESSION_OPTIONS: &str = "-c TimeZone=UTC";

type TextRow = Vec<Option<String>>;

/// PostgreSQL database reachable through a connection pool.
pub struct PgDatabase {
    pool: Pool,
    dialect: PostgresDialect,
    max_connections: usize,
    columns: RwLock<HashMap<TablePath, Arc<TableSchema>>>,
}

impl PgDatabase {
    /// Connect to a `postgres://` URI and verify the connection.
    ///
    /// `sslmode` in the URI selects TLS (disable, prefer, require, verify-ca,
    /// verify-full).
    pub async fn connect(uri: &str, max_connections: usize) -> Result<Self> {
        let (uri, ssl_mode) = SslMode::split_uri(uri)?;
        let mut pg_config: PgConfig = uri
            .parse()
            .map_err(|e| DiffError::Config(format!("invalid PostgreSQL URI: {}", e)))?;

        let options = match pg_config.get_options() {
            Some(existing) => format!("{} {}", existing, SESSION_OPTIONS),
            None => SESSION_OPTIONS.to_string(),
        };
        pg_config.options(&options);
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        if pg_config.get_connect_timeout().is_none() {
            pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);
        }
        let dbname = pg_config.get_dbname().unwrap_or("postgres").to_string();

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let builder = match make_tls_connector(ssl_mode)? {
            Some(tls) => Pool::builder(Manager::from_config(pg_config, tls, mgr_config)),
            None => {
                warn!("PostgreSQL TLS is disabled. Credentials will be transmitted in plaintext.");
                Pool::builder(Manager::from_config(pg_config, NoTls, mgr_config))
            }
        };
        let pool = builder
            .max_size(max_connections)
            .build()
            .map_err(|e| DiffError::Config(format!("creating PostgreSQL pool: {}", e)))?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;
        drop(client);

        info!(
            "Connected to PostgreSQL database {} (max {} connections)",
            dbname, max_connections
        );

        Ok(Self {
            pool,
            dialect: PostgresDialect::new(),
            max_connections,
            columns: RwLock::new(HashMap::new()),
        })
    }

    /// Run a query and return every field as text.
    async fn query_text(&self, sql: &str) -> Result<Vec<TextRow>> {
        debug!("{}: {}", BACKEND, sql);
        let client = self.pool.get().await?;
        let messages = client.simple_query(sql).await?;
        Ok(messages
            .into_iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => {
                    Some((0..row.len()).map(|i| row.get(i).map(str::to_string)).collect())
                }
                _ => None,
            })
            .collect())
    }

    async fn query_one(&self, sql: &str) -> Result<TextRow> {
        self.query_text(sql)
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

        let rows = self.query_text(&self.dialect.describe_query(table)).await?;
        if rows.is_empty() {
            return Err(DiffError::Schema(format!(
                "table {} does not exist or has no visible columns",
                table
            )));
        }
        let columns = rows
            .into_iter()
            .map(|row| {
                let field = |i: usize| row.get(i).cloned().flatten().unwrap_or_default();
                ColumnInfo::new(field(0), field(1), field(2) == "t")
            })
            .collect();
        let schema = Arc::new(TableSchema::new(columns));
        debug!("Loaded {} columns for {}", schema.columns.len(), table);

        self.columns
            .write()
            .await
            .insert(table.clone(), Arc::clone(&schema));
        Ok(schema)
    }
}

#[async_trait]
impl Database for PgDatabase {
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
        let row = self.query_one(&sql).await?;
        parse_count(BACKEND, row.first().cloned().flatten().as_deref())
    }

    async fn checksum(&self, query: &SegmentQuery<'_>) -> Result<Checksum> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?.checksum()?;
        let row = self.query_one(&sql).await?;
        parse_checksum(BACKEND, row.first().cloned().flatten().as_deref())
    }

    async fn count_and_checksum(&self, query: &SegmentQuery<'_>) -> Result<(u64, Checksum)> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?.count_and_checksum()?;
        let row = self.query_one(&sql).await?;
        let field = |i: usize| row.get(i).cloned().flatten();
        Ok((
            parse_count(BACKEND, field(0).as_deref())?,
            parse_checksum(BACKEND, field(1).as_deref())?,
        ))
    }

    async fn checkpoints(&self, query: &SegmentQuery<'_>, n: usize) -> Result<Vec<DbKey>> {
        let schema = self.table_schema(query.table).await?;
        let sql = SegmentSql::new(&self.dialect, *query, &schema)?;
        let kind = sql.key_kind();
        self.query_text(&sql.checkpoints(n)?)
            .await?
            .into_iter()
            .map(|row| parse_key(BACKEND, kind, row.first().cloned().flatten().as_deref()))
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
        self.pool.close();
    }
}

/// Stream a fetch query's rows into `tx` until they run out or the
/// receiver goes away.
async fn read_rows(pool: Pool, sql: String, kind: KeyKind, tx: mpsc::Sender<Result<Row>>) -> Result<()> {
    debug!("{}: {}", BACKEND, sql);
    let client = pool.get().await?;
    let rows = client.query_raw(sql.as_str(), Vec::<String>::new()).await?;
    futures::pin_mut!(rows);

    while let Some(row) = rows.try_next().await? {
        let fields = (0..row.len())
            .map(|i| row.try_get::<_, Option<String>>(i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        if tx.send(text_row(BACKEND, kind, fields)).await.is_err() {
            debug!("{}: fetch abandoned by its reader", BACKEND);
            break;
        }
    }
    Ok(())
}
