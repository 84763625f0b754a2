//! MySQL driver backed by mysql_async.
//!
//! Uses the text protocol so arbitrary LLM-generated statements run
//! unmodified. Transactions are driven with explicit statements on an
//! owned connection so the transaction object can outlive a borrow.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, SslOpts};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::{
    run_cancellable, ColumnSchema, DatabaseDriver, DatabaseType, DriverFactory, DriverTx,
    ForeignKeySchema, IndexSchema, QueryError, QueryErrorCode, QueryExecutionResult, QueryType,
    RowMap, SchemaInfo, TableSchema,
};
use crate::error::{NeoBaseError, Result};
use crate::models::{Connection, SelectedTables, StandardConnection};

/// Query timeout in seconds.
const QUERY_TIMEOUT_SECS: u64 = 30;

/// Maximum rows returned from a single query.
const MAX_ROWS: usize = 1000;

/// MySQL driver over a mysql_async pool.
pub struct MySqlDriver {
    pool: Pool,
    database: String,
}

pub(crate) struct MySqlFactory;

#[async_trait]
impl DriverFactory for MySqlFactory {
    async fn connect(
        &self,
        conn: &Connection,
        _chat_id: &str,
    ) -> Result<Box<dyn DatabaseDriver>> {
        let Connection::Mysql(details) = conn else {
            return Err(NeoBaseError::internal(format!(
                "mysql factory got a {} connection",
                conn.database_type()
            )));
        };
        Ok(Box::new(MySqlDriver::connect(details).await?))
    }
}

impl MySqlDriver {
    /// Connects and verifies the server is reachable.
    pub async fn connect(details: &StandardConnection) -> Result<Self> {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(details.host.clone())
            .tcp_port(details.port)
            .user(Some(details.username.clone()))
            .pass(details.password.clone())
            .db_name(Some(details.database.clone()));

        if details.use_ssl {
            builder = builder.ssl_opts(Some(SslOpts::default()));
        }

        let pool = Pool::new(Opts::from(builder));

        // Fail fast: surface bad credentials at connect time, not on
        // the first query.
        let mut conn = pool
            .get_conn()
            .await
            .map_err(|e| map_connect_error(e, &details.host))?;
        conn.ping()
            .await
            .map_err(|e| map_connect_error(e, &details.host))?;
        drop(conn);

        debug!(host = %details.host, "Connected to mysql");
        Ok(Self {
            pool,
            database: details.database.clone(),
        })
    }
}

#[async_trait]
impl DatabaseDriver for MySqlDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::MySql
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool
            .clone()
            .disconnect()
            .await
            .map_err(|e| NeoBaseError::connection(format!("disconnect failed: {e}")))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| NeoBaseError::connection_lost(format!("ping failed: {e}")))?;
        conn.ping()
            .await
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
        let fut = async {
            let mut conn = self.pool.get_conn().await?;
            run_on_conn(&mut conn, query, query_type).await
        };
        finish_execution(ctx, fut, start).await
    }

    async fn begin_tx(&self, ctx: &CancellationToken) -> Result<Box<dyn DriverTx>> {
        let mut conn = run_cancellable(ctx, async {
            self.pool
                .get_conn()
                .await
                .map_err(|e| NeoBaseError::connection_lost(format!("failed to get connection: {e}")))
        })
        .await?;

        conn.query_drop("START TRANSACTION")
            .await
            .map_err(|e| NeoBaseError::query(format!("failed to open transaction: {e}")))?;

        Ok(Box::new(MySqlTx { conn: Some(conn) }))
    }

    async fn get_schema(
        &self,
        ctx: &CancellationToken,
        selected: &SelectedTables,
    ) -> Result<SchemaInfo> {
        let info = run_cancellable(ctx, introspect_schema(&self.pool, &self.database)).await?;
        Ok(info.filtered(selected))
    }

    async fn fetch_example_records(
        &self,
        ctx: &CancellationToken,
        table: &str,
        limit: usize,
    ) -> Result<Vec<RowMap>> {
        let sql = format!(
            "SELECT * FROM {} LIMIT {}",
            quote_ident(table),
            limit.min(MAX_ROWS)
        );
        run_cancellable(ctx, async {
            let mut conn = self
                .pool
                .get_conn()
                .await
                .map_err(|e| NeoBaseError::connection_lost(e.to_string()))?;
            let rows: Vec<mysql_async::Row> = conn
                .query(sql)
                .await
                .map_err(|e| NeoBaseError::query(format!("failed to sample '{table}': {e}")))?;
            Ok(rows.iter().map(convert_row).collect())
        })
        .await
    }
}

/// Transaction driven with explicit statements on an owned connection.
struct MySqlTx {
    conn: Option<Conn>,
}

#[async_trait]
impl DriverTx for MySqlTx {
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        let start = Instant::now();
        let Some(conn) = self.conn.as_mut() else {
            return QueryExecutionResult::failed(
                QueryError::new(QueryErrorCode::Other, "Transaction already closed"),
                0,
            );
        };
        let fut = run_on_conn(conn, query, query_type);
        finish_execution(ctx, fut, start).await
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        conn.query_drop("COMMIT")
            .await
            .map_err(|e| NeoBaseError::query(format!("commit failed: {e}")))
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        conn.query_drop("ROLLBACK")
            .await
            .map_err(|e| NeoBaseError::query(format!("rollback failed: {e}")))
    }
}

async fn run_on_conn(
    conn: &mut Conn,
    query: &str,
    query_type: QueryType,
) -> std::result::Result<QueryExecutionResult, mysql_async::Error> {
    if query_type.is_mutating() {
        conn.query_drop(query).await?;
        Ok(QueryExecutionResult::with_affected(conn.affected_rows(), 0))
    } else {
        let rows: Vec<mysql_async::Row> = conn.query(query).await?;
        let converted = rows.iter().take(MAX_ROWS).map(convert_row).collect();
        Ok(QueryExecutionResult::with_rows(converted, 0))
    }
}

async fn finish_execution<F>(
    ctx: &CancellationToken,
    fut: F,
    start: Instant,
) -> QueryExecutionResult
where
    F: std::future::Future<Output = std::result::Result<QueryExecutionResult, mysql_async::Error>>,
{
    let timed = tokio::time::timeout(Duration::from_secs(QUERY_TIMEOUT_SECS), fut);

    let outcome = tokio::select! {
        _ = ctx.cancelled() => {
            return QueryExecutionResult::failed(
                QueryError::new(QueryErrorCode::Other, "Query cancelled"),
                start.elapsed().as_millis() as u64,
            );
        }
        outcome = timed => outcome,
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(mut result)) => {
            result.execution_time_ms = elapsed_ms;
            result
        }
        Ok(Err(e)) => QueryExecutionResult::failed(classify_error(&e), elapsed_ms),
        Err(_) => QueryExecutionResult::failed(
            QueryError::new(
                QueryErrorCode::Timeout,
                format!("Query timed out after {QUERY_TIMEOUT_SECS} seconds"),
            ),
            elapsed_ms,
        ),
    }
}

/// Converts a MySQL row to the uniform JSON row map.
fn convert_row(row: &mysql_async::Row) -> RowMap {
    let mut map = RowMap::new();
    for (i, col) in row.columns_ref().iter().enumerate() {
        let value = row
            .as_ref(i)
            .map(convert_value)
            .unwrap_or(serde_json::Value::Null);
        map.insert(col.name_str().to_string(), value);
    }
    map
}

fn convert_value(value: &mysql_async::Value) -> serde_json::Value {
    use mysql_async::Value as V;
    use serde_json::Value as J;

    match value {
        V::NULL => J::Null,
        V::Bytes(bytes) => J::String(String::from_utf8_lossy(bytes).into_owned()),
        V::Int(n) => J::Number((*n).into()),
        V::UInt(n) => J::Number((*n).into()),
        V::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(J::Number)
            .unwrap_or(J::Null),
        V::Double(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        V::Date(y, m, d, hh, mm, ss, _us) => {
            if *hh == 0 && *mm == 0 && *ss == 0 {
                J::String(format!("{y:04}-{m:02}-{d:02}"))
            } else {
                J::String(format!("{y:04}-{m:02}-{d:02} {hh:02}:{mm:02}:{ss:02}"))
            }
        }
        V::Time(neg, days, hours, minutes, seconds, _us) => {
            let sign = if *neg { "-" } else { "" };
            let total_hours = u32::from(*hours) + days * 24;
            J::String(format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}"))
        }
    }
}

/// Maps a mysql_async error to the structured classification.
fn classify_error(e: &mysql_async::Error) -> QueryError {
    match e {
        mysql_async::Error::Server(server) => {
            let classified = match server.code {
                1064 | 1054 | 1146 => QueryErrorCode::Syntax,
                1044 | 1045 | 1142 | 1143 | 1227 => QueryErrorCode::Permission,
                1048 | 1062 | 1216 | 1217 | 1451 | 1452 | 3819 => QueryErrorCode::Constraint,
                1205 | 1317 => QueryErrorCode::Timeout,
                1927 | 2006 | 2013 => QueryErrorCode::ConnectionLost,
                _ => QueryErrorCode::Other,
            };
            QueryError::new(classified, server.message.clone())
                .with_details(format!("mysql error {}", server.code))
        }
        mysql_async::Error::Io(_) => QueryError::new(
            QueryErrorCode::ConnectionLost,
            "Lost connection to the database",
        )
        .with_details(e.to_string()),
        other => QueryError::new(QueryErrorCode::Other, other.to_string()),
    }
}

fn map_connect_error(e: mysql_async::Error, host: &str) -> NeoBaseError {
    match &e {
        mysql_async::Error::Server(server) if server.code == 1045 => {
            NeoBaseError::connection("Authentication failed. Check username and password.")
        }
        mysql_async::Error::Server(server) if server.code == 1049 => {
            NeoBaseError::connection("Database does not exist.")
        }
        mysql_async::Error::Io(_) => {
            NeoBaseError::connection_lost(format!("Cannot reach database host '{host}'"))
        }
        _ => NeoBaseError::connection(e.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

async fn introspect_schema(pool: &Pool, database: &str) -> Result<SchemaInfo> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| NeoBaseError::connection_lost(e.to_string()))?;

    let tables: Vec<(String, Option<u64>, Option<u64>)> = conn
        .exec(
            r"SELECT TABLE_NAME, TABLE_ROWS, DATA_LENGTH + INDEX_LENGTH
              FROM information_schema.TABLES
              WHERE TABLE_SCHEMA = ? AND TABLE_TYPE = 'BASE TABLE'
              ORDER BY TABLE_NAME",
            (database,),
        )
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to list tables: {e}")))?;

    let columns: Vec<(String, String, String, String, Option<String>)> = conn
        .exec(
            r"SELECT TABLE_NAME, COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_DEFAULT
              FROM information_schema.COLUMNS
              WHERE TABLE_SCHEMA = ?
              ORDER BY TABLE_NAME, ORDINAL_POSITION",
            (database,),
        )
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to fetch columns: {e}")))?;

    let stats: Vec<(String, String, i64, String)> = conn
        .exec(
            r"SELECT TABLE_NAME, INDEX_NAME, NON_UNIQUE, COLUMN_NAME
              FROM information_schema.STATISTICS
              WHERE TABLE_SCHEMA = ?
              ORDER BY TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX",
            (database,),
        )
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to fetch indexes: {e}")))?;

    let fks: Vec<(String, String, String, String)> = conn
        .exec(
            r"SELECT TABLE_NAME, COLUMN_NAME, REFERENCED_TABLE_NAME, REFERENCED_COLUMN_NAME
              FROM information_schema.KEY_COLUMN_USAGE
              WHERE TABLE_SCHEMA = ? AND REFERENCED_TABLE_NAME IS NOT NULL
              ORDER BY TABLE_NAME, ORDINAL_POSITION",
            (database,),
        )
        .await
        .map_err(|e| NeoBaseError::query(format!("failed to fetch foreign keys: {e}")))?;

    let mut columns_by_table: HashMap<String, Vec<ColumnSchema>> = HashMap::new();
    for (table, name, data_type, nullable, default) in columns {
        columns_by_table.entry(table).or_default().push(ColumnSchema {
            name,
            data_type,
            is_nullable: nullable == "YES",
            default,
        });
    }

    let mut pks_by_table: HashMap<String, Vec<String>> = HashMap::new();
    let mut indexes_by_table: HashMap<String, Vec<IndexSchema>> = HashMap::new();
    for (table, index_name, non_unique, column) in stats {
        if index_name == "PRIMARY" {
            pks_by_table.entry(table).or_default().push(column);
            continue;
        }
        let indexes = indexes_by_table.entry(table).or_default();
        match indexes.iter_mut().find(|ix| ix.name == index_name) {
            Some(ix) => ix.columns.push(column),
            None => indexes.push(IndexSchema {
                name: index_name,
                columns: vec![column],
                is_unique: non_unique == 0,
            }),
        }
    }

    let mut fks_by_table: HashMap<String, Vec<ForeignKeySchema>> = HashMap::new();
    for (table, from_col, to_table, to_col) in fks {
        fks_by_table.entry(table).or_default().push(ForeignKeySchema {
            from_columns: vec![from_col],
            to_table,
            to_columns: vec![to_col],
        });
    }

    let mut info = SchemaInfo::new();
    for (name, row_count, size_bytes) in tables {
        info.insert_table(TableSchema {
            columns: columns_by_table.remove(&name).unwrap_or_default(),
            primary_key: pks_by_table.remove(&name).unwrap_or_default(),
            indexes: indexes_by_table.remove(&name).unwrap_or_default(),
            foreign_keys: fks_by_table.remove(&name).unwrap_or_default(),
            row_count: row_count.unwrap_or(0),
            size_bytes: size_bytes.unwrap_or(0),
            name,
        });
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "`users`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_convert_value_scalars() {
        use mysql_async::Value as V;
        assert_eq!(convert_value(&V::NULL), serde_json::Value::Null);
        assert_eq!(convert_value(&V::Int(42)), serde_json::json!(42));
        assert_eq!(
            convert_value(&V::Bytes(b"hello".to_vec())),
            serde_json::json!("hello")
        );
    }

    #[test]
    fn test_convert_value_temporal() {
        use mysql_async::Value as V;
        assert_eq!(
            convert_value(&V::Date(2024, 3, 1, 0, 0, 0, 0)),
            serde_json::json!("2024-03-01")
        );
        assert_eq!(
            convert_value(&V::Date(2024, 3, 1, 13, 5, 9, 0)),
            serde_json::json!("2024-03-01 13:05:09")
        );
        assert_eq!(
            convert_value(&V::Time(true, 1, 2, 30, 0, 0)),
            serde_json::json!("-26:30:00")
        );
    }

    #[test]
    fn test_classify_server_errors() {
        let syntax = mysql_async::ServerError {
            code: 1064,
            message: "You have an error in your SQL syntax".into(),
            state: "42000".into(),
        };
        assert_eq!(
            classify_error(&mysql_async::Error::Server(syntax)).code,
            QueryErrorCode::Syntax
        );

        let dup = mysql_async::ServerError {
            code: 1062,
            message: "Duplicate entry".into(),
            state: "23000".into(),
        };
        assert_eq!(
            classify_error(&mysql_async::Error::Server(dup)).code,
            QueryErrorCode::Constraint
        );
    }
}
