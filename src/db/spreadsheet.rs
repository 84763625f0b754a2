//! Spreadsheet driver: uploaded tabular data in the shared relational
//! store.
//!
//! Each spreadsheet-backed chat owns one schema (`conn_<chatID>`) in a
//! shared Postgres database. The schema is provisioned lazily on first
//! use. Every query runs with the session search path pointed at that
//! schema and restored on exit; inside a transaction the path is set
//! with `SET LOCAL` exactly once, so every exit path (commit or
//! rollback) restores it automatically.
//!
//! Cell values are stored AES-GCM encrypted with a marker prefix;
//! reads decrypt transparently and pass legacy plaintext through.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Connection as SqlxConnection;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SpreadsheetStoreConfig;
use crate::crypto::FieldCipher;
use crate::db::postgres::{self, quote_ident};
use crate::db::{
    run_cancellable, DatabaseDriver, DatabaseType, DriverFactory, DriverTx, QueryError,
    QueryErrorCode, QueryExecutionResult, QueryType, RowMap, SchemaInfo,
};
use crate::error::{NeoBaseError, Result};
use crate::models::{Connection, SelectedTables};

/// Internal columns present on every spreadsheet table.
pub const INTERNAL_COLUMNS: [&str; 3] = ["_id", "_created_at", "_updated_at"];

/// The shared relational store behind all spreadsheet connections.
///
/// One pool and one data-encryption cipher, shared by every chat's
/// driver and by the ingest engine.
pub struct SpreadsheetStore {
    pool: PgPool,
    cipher: FieldCipher,
}

impl SpreadsheetStore {
    /// Connects the shared pool.
    pub async fn connect(config: &SpreadsheetStoreConfig, cipher: FieldCipher) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.connection_string())
            .await
            .map_err(|e| {
                NeoBaseError::connection(format!("Cannot reach the spreadsheet store: {e}"))
            })?;
        Ok(Self { pool, cipher })
    }

    /// Builds a store over an existing pool. Used by tests.
    pub fn from_pool(pool: PgPool, cipher: FieldCipher) -> Self {
        Self { pool, cipher }
    }

    /// The shared pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The cell-data cipher.
    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    /// Schema name for a chat.
    pub fn schema_for_chat(chat_id: &str) -> String {
        format!("conn_{chat_id}")
    }

    /// Creates the schema if it does not exist yet.
    pub async fn ensure_schema(&self, schema: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(schema)
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to create schema '{schema}': {e}")))?;
        debug!(schema, "Spreadsheet schema ready");
        Ok(())
    }

    /// Drops a chat's schema and everything in it.
    pub async fn drop_schema(&self, schema: &str) -> Result<()> {
        sqlx::query(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            quote_ident(schema)
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to drop schema '{schema}': {e}")))?;
        info!(schema, "Spreadsheet schema dropped");
        Ok(())
    }
}

pub(crate) struct SpreadsheetFactory {
    store: Arc<SpreadsheetStore>,
}

impl SpreadsheetFactory {
    pub(crate) fn new(store: Arc<SpreadsheetStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DriverFactory for SpreadsheetFactory {
    async fn connect(&self, conn: &Connection, chat_id: &str) -> Result<Box<dyn DatabaseDriver>> {
        if !conn.is_spreadsheet_backed() {
            return Err(NeoBaseError::internal(format!(
                "spreadsheet factory got a {} connection",
                conn.database_type()
            )));
        }
        Ok(Box::new(SpreadsheetDriver::new(
            self.store.clone(),
            chat_id,
        )))
    }
}

/// Driver for one chat's slice of the shared store.
pub struct SpreadsheetDriver {
    store: Arc<SpreadsheetStore>,
    schema: String,
    provisioned: OnceCell<()>,
}

impl SpreadsheetDriver {
    /// Creates the driver. The backing schema is not touched until the
    /// first operation that needs it.
    pub fn new(store: Arc<SpreadsheetStore>, chat_id: &str) -> Self {
        Self {
            schema: SpreadsheetStore::schema_for_chat(chat_id),
            store,
            provisioned: OnceCell::new(),
        }
    }

    /// The schema this driver operates in.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Lazily provisions the schema, at most once per driver.
    async fn ensure_provisioned(&self) -> Result<()> {
        self.provisioned
            .get_or_try_init(|| self.store.ensure_schema(&self.schema))
            .await
            .map(|_| ())
    }

    /// Decrypts string cells in place; legacy plaintext passes through.
    fn decrypt_rows(&self, rows: &mut [RowMap]) {
        for row in rows.iter_mut() {
            for value in row.values_mut() {
                if let serde_json::Value::String(s) = value {
                    if FieldCipher::is_encrypted(s) {
                        if let Ok(plain) = self.store.cipher.decrypt(s) {
                            *value = serde_json::Value::String(plain);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DatabaseDriver for SpreadsheetDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Spreadsheet
    }

    async fn disconnect(&self) -> Result<()> {
        // The pool is shared with other chats; nothing to close here.
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.store.pool)
            .await
            .map(|_| ())
            .map_err(|e| NeoBaseError::connection_lost(format!("ping failed: {e}")))
    }

    async fn execute_query(
        &self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        let start = Instant::now();
        if let Err(e) = self.ensure_provisioned().await {
            return QueryExecutionResult::failed(
                QueryError::new(QueryErrorCode::Other, e.to_string()),
                start.elapsed().as_millis() as u64,
            );
        }

        // A dedicated connection keeps the search-path change from
        // leaking to other chats on the shared pool.
        let mut conn = match self.store.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                return QueryExecutionResult::failed(
                    postgres::classify_error(&e),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let set_path = format!("SET search_path TO {}", quote_ident(&self.schema));
        if let Err(e) = sqlx::query(&set_path).execute(&mut *conn).await {
            return QueryExecutionResult::failed(
                postgres::classify_error(&e),
                start.elapsed().as_millis() as u64,
            );
        }

        let mut result = run_in_search_path(ctx, &mut conn, query, query_type).await;

        // Restore before the connection returns to the pool.
        let _ = sqlx::query("SET search_path TO DEFAULT")
            .execute(&mut *conn)
            .await;

        result.execution_time_ms = start.elapsed().as_millis() as u64;
        self.decrypt_rows(&mut result.rows);
        result
    }

    async fn begin_tx(&self, ctx: &CancellationToken) -> Result<Box<dyn DriverTx>> {
        self.ensure_provisioned().await?;
        let tx = run_cancellable(ctx, async {
            self.store.pool.begin().await.map_err(|e| {
                NeoBaseError::connection_lost(format!("failed to open transaction: {e}"))
            })
        })
        .await?;
        Ok(Box::new(SpreadsheetTx {
            tx,
            schema: self.schema.clone(),
            cipher: self.store.cipher.clone(),
            path_set: false,
        }))
    }

    async fn get_schema(
        &self,
        ctx: &CancellationToken,
        selected: &SelectedTables,
    ) -> Result<SchemaInfo> {
        self.ensure_provisioned().await?;
        let info =
            run_cancellable(ctx, postgres::introspect_schema(&self.store.pool, &self.schema))
                .await?;
        Ok(info.filtered(selected))
    }

    async fn fetch_example_records(
        &self,
        ctx: &CancellationToken,
        table: &str,
        limit: usize,
    ) -> Result<Vec<RowMap>> {
        self.ensure_provisioned().await?;
        let mut rows =
            postgres::fetch_examples(ctx, &self.store.pool, &self.schema, table, limit).await?;
        self.decrypt_rows(&mut rows);
        Ok(rows)
    }

    async fn delete_connection_data(&self, _ctx: &CancellationToken) -> Result<()> {
        self.store.drop_schema(&self.schema).await
    }
}

async fn run_in_search_path(
    ctx: &CancellationToken,
    conn: &mut sqlx::pool::PoolConnection<sqlx::Postgres>,
    query: &str,
    query_type: QueryType,
) -> QueryExecutionResult {
    let fut = async {
        if query_type.is_mutating() {
            // Single-statement writes get their own transaction.
            let mut tx = conn.begin().await.map_err(|e| postgres::classify_error(&e))?;
            let done = sqlx::query(query)
                .execute(&mut *tx)
                .await
                .map_err(|e| postgres::classify_error(&e))?;
            tx.commit().await.map_err(|e| postgres::classify_error(&e))?;
            Ok(QueryExecutionResult::with_affected(done.rows_affected(), 0))
        } else {
            let rows = sqlx::query(query)
                .fetch_all(&mut **conn)
                .await
                .map_err(|e| postgres::classify_error(&e))?;
            let converted = rows
                .iter()
                .take(postgres::MAX_ROWS)
                .map(postgres::convert_row)
                .collect();
            Ok(QueryExecutionResult::with_rows(converted, 0))
        }
    };

    tokio::select! {
        _ = ctx.cancelled() => QueryExecutionResult::failed(
            QueryError::new(QueryErrorCode::Other, "Query cancelled"),
            0,
        ),
        outcome = fut => match outcome {
            Ok(result) => result,
            Err(error) => QueryExecutionResult::failed(error, 0),
        },
    }
}

/// Transaction scoped to a chat schema.
///
/// `SET LOCAL search_path` applies only for the lifetime of the
/// transaction, so the path resets on commit and rollback alike; the
/// flag guarantees the statement runs at most once.
struct SpreadsheetTx {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
    schema: String,
    cipher: FieldCipher,
    path_set: bool,
}

impl SpreadsheetTx {
    async fn ensure_search_path(&mut self) -> std::result::Result<(), QueryError> {
        if self.path_set {
            return Ok(());
        }
        let set_path = format!("SET LOCAL search_path TO {}", quote_ident(&self.schema));
        sqlx::query(&set_path)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| postgres::classify_error(&e))?;
        self.path_set = true;
        Ok(())
    }
}

#[async_trait]
impl DriverTx for SpreadsheetTx {
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        let start = Instant::now();
        if let Err(error) = self.ensure_search_path().await {
            return QueryExecutionResult::failed(error, start.elapsed().as_millis() as u64);
        }

        let fut = async {
            if query_type.is_mutating() {
                let done = sqlx::query(query)
                    .execute(&mut *self.tx)
                    .await
                    .map_err(|e| postgres::classify_error(&e))?;
                Ok(QueryExecutionResult::with_affected(done.rows_affected(), 0))
            } else {
                let rows = sqlx::query(query)
                    .fetch_all(&mut *self.tx)
                    .await
                    .map_err(|e| postgres::classify_error(&e))?;
                let converted = rows
                    .iter()
                    .take(postgres::MAX_ROWS)
                    .map(postgres::convert_row)
                    .collect();
                Ok(QueryExecutionResult::with_rows(converted, 0))
            }
        };

        let outcome = tokio::select! {
            _ = ctx.cancelled() => {
                return QueryExecutionResult::failed(
                    QueryError::new(QueryErrorCode::Other, "Query cancelled"),
                    start.elapsed().as_millis() as u64,
                );
            }
            outcome = fut => outcome,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match outcome {
            Ok(mut result) => {
                result.execution_time_ms = elapsed_ms;
                for row in result.rows.iter_mut() {
                    for value in row.values_mut() {
                        if let serde_json::Value::String(s) = value {
                            if FieldCipher::is_encrypted(s) {
                                if let Ok(plain) = self.cipher.decrypt(s) {
                                    *value = serde_json::Value::String(plain);
                                }
                            }
                        }
                    }
                }
                result
            }
            Err(error) => QueryExecutionResult::failed(error, elapsed_ms),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| NeoBaseError::query(format!("commit failed: {e}")))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| NeoBaseError::query(format!("rollback failed: {e}")))
    }
}
