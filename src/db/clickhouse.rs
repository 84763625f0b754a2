//! ClickHouse driver over the HTTP interface.
//!
//! Reads are fetched as `JSONEachRow` lines and parsed straight into
//! the uniform row maps, so arbitrary SELECTs work without compile-time
//! row types. ClickHouse has no multi-statement transactions; `begin_tx`
//! returns a pass-through that executes statements directly and treats
//! commit and rollback as no-ops.

use async_trait::async_trait;
use clickhouse::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::db::{
    run_cancellable, ColumnSchema, DatabaseDriver, DatabaseType, DriverFactory, DriverTx,
    IndexSchema, QueryError, QueryErrorCode, QueryExecutionResult, QueryType, RowMap, SchemaInfo,
    TableSchema,
};
use crate::error::{NeoBaseError, Result};
use crate::models::{Connection, SelectedTables, StandardConnection};

/// Query timeout in seconds.
const QUERY_TIMEOUT_SECS: u64 = 60;

/// Maximum rows returned from a single query.
const MAX_ROWS: usize = 1000;

/// ClickHouse driver.
pub struct ClickHouseDriver {
    client: Client,
    database: String,
}

pub(crate) struct ClickHouseFactory;

#[async_trait]
impl DriverFactory for ClickHouseFactory {
    async fn connect(
        &self,
        conn: &Connection,
        _chat_id: &str,
    ) -> Result<Box<dyn DatabaseDriver>> {
        let Connection::Clickhouse(details) = conn else {
            return Err(NeoBaseError::internal(format!(
                "clickhouse factory got a {} connection",
                conn.database_type()
            )));
        };
        Ok(Box::new(ClickHouseDriver::connect(details).await?))
    }
}

impl ClickHouseDriver {
    /// Connects and verifies the server answers.
    pub async fn connect(details: &StandardConnection) -> Result<Self> {
        let scheme = if details.use_ssl { "https" } else { "http" };
        let url = format!("{scheme}://{}:{}", details.host, details.port);

        let mut client = Client::default()
            .with_url(url)
            .with_user(details.username.clone())
            .with_database(details.database.clone());
        if let Some(password) = &details.password {
            client = client.with_password(password.clone());
        }

        let driver = Self {
            client,
            database: details.database.clone(),
        };
        driver.ping().await.map_err(|e| {
            NeoBaseError::connection(format!(
                "Cannot reach ClickHouse at '{}': {e}",
                details.host
            ))
        })?;
        debug!(host = %details.host, "Connected to clickhouse");
        Ok(driver)
    }

    async fn run(
        &self,
        query: &str,
        query_type: QueryType,
    ) -> std::result::Result<QueryExecutionResult, QueryError> {
        if query_type.is_mutating() {
            self.client
                .query(query)
                .execute()
                .await
                .map_err(|e| classify_error(&e))?;
            // ClickHouse does not report affected rows over HTTP.
            return Ok(QueryExecutionResult::default());
        }

        let reader = self
            .client
            .query(query)
            .fetch_bytes("JSONEachRow")
            .map_err(|e| classify_error(&e))?;
        let mut lines = reader.lines();
        let mut rows: Vec<RowMap> = Vec::new();

        loop {
            let line = lines.next_line().await.map_err(|e| {
                QueryError::new(QueryErrorCode::ConnectionLost, "Lost connection to ClickHouse")
                    .with_details(e.to_string())
            })?;
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(serde_json::Value::Object(obj)) => {
                    if rows.len() < MAX_ROWS {
                        rows.push(obj);
                    } else {
                        warn!("Query exceeded {} rows, result truncated", MAX_ROWS);
                        break;
                    }
                }
                _ => warn!("Unexpected JSONEachRow line: {}", line),
            }
        }

        Ok(QueryExecutionResult::with_rows(rows, 0))
    }
}

#[async_trait]
impl DatabaseDriver for ClickHouseDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::ClickHouse
    }

    async fn disconnect(&self) -> Result<()> {
        // The HTTP client holds no server-side session.
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .execute()
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
        let timed = tokio::time::timeout(
            Duration::from_secs(QUERY_TIMEOUT_SECS),
            self.run(query, query_type),
        );

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
            Ok(Err(error)) => QueryExecutionResult::failed(error, elapsed_ms),
            Err(_) => QueryExecutionResult::failed(
                QueryError::new(
                    QueryErrorCode::Timeout,
                    format!("Query timed out after {QUERY_TIMEOUT_SECS} seconds"),
                ),
                elapsed_ms,
            ),
        }
    }

    async fn begin_tx(&self, _ctx: &CancellationToken) -> Result<Box<dyn DriverTx>> {
        Ok(Box::new(ClickHouseTx {
            client: self.client.clone(),
            database: self.database.clone(),
        }))
    }

    async fn get_schema(
        &self,
        ctx: &CancellationToken,
        selected: &SelectedTables,
    ) -> Result<SchemaInfo> {
        let info = run_cancellable(ctx, introspect_schema(&self.client, &self.database)).await?;
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
            let result = self
                .run(&sql, QueryType::Read)
                .await
                .map_err(|e| NeoBaseError::query(format!("failed to sample '{table}': {e}")))?;
            Ok(result.rows)
        })
        .await
    }
}

/// Pass-through "transaction": statements are applied immediately.
struct ClickHouseTx {
    client: Client,
    database: String,
}

#[async_trait]
impl DriverTx for ClickHouseTx {
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        find_count: bool,
    ) -> QueryExecutionResult {
        let driver = ClickHouseDriver {
            client: self.client.clone(),
            database: self.database.clone(),
        };
        driver.execute_query(ctx, query, query_type, find_count).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        warn!("ClickHouse has no transaction rollback; statements were applied immediately");
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "\\`"))
}

/// Maps a clickhouse crate error to the structured classification.
fn classify_error(e: &clickhouse::error::Error) -> QueryError {
    use clickhouse::error::Error as ChError;

    match e {
        ChError::Network(_) => QueryError::new(
            QueryErrorCode::ConnectionLost,
            "Lost connection to ClickHouse",
        )
        .with_details(e.to_string()),
        ChError::TimedOut => QueryError::new(QueryErrorCode::Timeout, "ClickHouse query timed out"),
        ChError::BadResponse(message) => {
            let classified = match extract_server_code(message) {
                Some(62) | Some(47) | Some(60) | Some(352) => QueryErrorCode::Syntax,
                Some(497) | Some(516) => QueryErrorCode::Permission,
                Some(159) | Some(160) => QueryErrorCode::Timeout,
                Some(209) | Some(210) => QueryErrorCode::ConnectionLost,
                _ => QueryErrorCode::Other,
            };
            QueryError::new(classified, message.clone())
        }
        other => QueryError::new(QueryErrorCode::Other, other.to_string()),
    }
}

/// Pulls the numeric server error code out of an exception message
/// shaped like `Code: 62. DB::Exception: ...`.
fn extract_server_code(message: &str) -> Option<u32> {
    let rest = message.strip_prefix("Code: ").or_else(|| {
        message
            .find("Code: ")
            .map(|idx| &message[idx + "Code: ".len()..])
    })?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

async fn introspect_schema(client: &Client, database: &str) -> Result<SchemaInfo> {
    // system.columns carries types, defaults, and primary-key flags in
    // one pass; sizes and row counts come from system.tables.
    let columns_sql = format!(
        "SELECT table, name, type, default_expression, is_in_primary_key \
         FROM system.columns WHERE database = '{database}' ORDER BY table, position \
         FORMAT JSONEachRow"
    );
    let tables_sql = format!(
        "SELECT name, total_rows, total_bytes FROM system.tables \
         WHERE database = '{database}' AND engine NOT LIKE '%View' ORDER BY name \
         FORMAT JSONEachRow"
    );
    let indexes_sql = format!(
        "SELECT table, name, expr FROM system.data_skipping_indices \
         WHERE database = '{database}' ORDER BY table, name FORMAT JSONEachRow"
    );

    let (columns, tables, indexes) = tokio::join!(
        fetch_json_rows(client, &columns_sql),
        fetch_json_rows(client, &tables_sql),
        fetch_json_rows(client, &indexes_sql),
    );
    let (columns, tables, indexes) = (columns?, tables?, indexes?);

    let mut columns_by_table: HashMap<String, Vec<ColumnSchema>> = HashMap::new();
    let mut pks_by_table: HashMap<String, Vec<String>> = HashMap::new();
    for row in columns {
        let table = str_field(&row, "table");
        let name = str_field(&row, "name");
        let default = match str_field(&row, "default_expression") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let data_type = str_field(&row, "type");
        if u64_field(&row, "is_in_primary_key") == 1 {
            pks_by_table.entry(table.clone()).or_default().push(name.clone());
        }
        columns_by_table.entry(table).or_default().push(ColumnSchema {
            name,
            // Nullable(...) wrapping is ClickHouse's nullability marker.
            is_nullable: data_type.starts_with("Nullable("),
            data_type,
            default,
        });
    }

    let mut indexes_by_table: HashMap<String, Vec<IndexSchema>> = HashMap::new();
    for row in indexes {
        let table = str_field(&row, "table");
        indexes_by_table.entry(table).or_default().push(IndexSchema {
            name: str_field(&row, "name"),
            columns: vec![str_field(&row, "expr")],
            is_unique: false,
        });
    }

    let mut info = SchemaInfo::new();
    for row in tables {
        let name = str_field(&row, "name");
        info.insert_table(TableSchema {
            columns: columns_by_table.remove(&name).unwrap_or_default(),
            primary_key: pks_by_table.remove(&name).unwrap_or_default(),
            indexes: indexes_by_table.remove(&name).unwrap_or_default(),
            foreign_keys: Vec::new(),
            row_count: u64_field(&row, "total_rows"),
            size_bytes: u64_field(&row, "total_bytes"),
            name,
        });
    }
    Ok(info)
}

async fn fetch_json_rows(client: &Client, sql: &str) -> Result<Vec<RowMap>> {
    let reader = client
        .query(sql)
        .fetch_bytes("JSONEachRow")
        .map_err(|e| NeoBaseError::query(format!("introspection failed: {e}")))?;
    let mut lines = reader.lines();
    let mut rows = Vec::new();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| NeoBaseError::query(format!("introspection read failed: {e}")))?
    {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(&line) {
            rows.push(obj);
        }
    }
    Ok(rows)
}

fn str_field(row: &RowMap, key: &str) -> String {
    row.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn u64_field(row: &RowMap, key: &str) -> u64 {
    match row.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_server_code() {
        assert_eq!(
            extract_server_code("Code: 62. DB::Exception: Syntax error"),
            Some(62)
        );
        assert_eq!(
            extract_server_code("bad response: Code: 497. DB::Exception: denied"),
            Some(497)
        );
        assert_eq!(extract_server_code("no code here"), None);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("events"), "`events`");
    }

    #[test]
    fn test_field_helpers() {
        let row: RowMap = serde_json::from_str(
            r#"{"name":"events","total_rows":"12345","total_bytes":99}"#,
        )
        .unwrap();
        assert_eq!(str_field(&row, "name"), "events");
        assert_eq!(u64_field(&row, "total_rows"), 12345);
        assert_eq!(u64_field(&row, "total_bytes"), 99);
        assert_eq!(u64_field(&row, "missing"), 0);
    }
}
