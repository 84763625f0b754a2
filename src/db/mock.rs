//! Mock drivers for tests.
//!
//! `MockDriver` answers from canned data and records every query it
//! sees; `FailingDriver` fails every operation. Both let the manager,
//! chat service, and integration tests run without a database.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::{
    ColumnSchema, DatabaseDriver, DatabaseType, DriverTx, QueryError, QueryErrorCode,
    QueryExecutionResult, QueryType, RowMap, SchemaInfo, TableSchema,
};
use crate::error::{NeoBaseError, Result};
use crate::models::SelectedTables;

/// In-memory driver returning canned results.
pub struct MockDriver {
    schema: SchemaInfo,
    rows: Vec<RowMap>,
    /// Every query text passed to `execute_query` or a transaction.
    pub executed: Mutex<Vec<String>>,
    alive: AtomicBool,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Creates a mock with a small `users` table.
    pub fn new() -> Self {
        let mut schema = SchemaInfo::new();
        schema.insert_table(TableSchema {
            name: "users".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    data_type: "integer".into(),
                    is_nullable: false,
                    default: None,
                },
                ColumnSchema {
                    name: "name".into(),
                    data_type: "text".into(),
                    is_nullable: true,
                    default: None,
                },
            ],
            primary_key: vec!["id".into()],
            indexes: vec![],
            foreign_keys: vec![],
            row_count: 2,
            size_bytes: 8192,
        });

        let rows = vec![
            serde_json::from_value(serde_json::json!({"id": 1, "name": "Alice"})).unwrap(),
            serde_json::from_value(serde_json::json!({"id": 2, "name": "Bob"})).unwrap(),
        ];

        Self {
            schema,
            rows,
            executed: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        }
    }

    /// Replaces the canned schema.
    pub fn with_schema(mut self, schema: SchemaInfo) -> Self {
        self.schema = schema;
        self
    }

    /// Replaces the canned rows.
    pub fn with_rows(mut self, rows: Vec<RowMap>) -> Self {
        self.rows = rows;
        self
    }

    /// Makes subsequent liveness checks fail.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn record(&self, query: &str) {
        self.executed
            .lock()
            .expect("mock executed lock")
            .push(query.to_string());
    }
}

#[async_trait]
impl DatabaseDriver for MockDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NeoBaseError::connection_lost("mock connection is down"))
        }
    }

    async fn execute_query(
        &self,
        _ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        self.record(query);
        if query_type.is_mutating() {
            QueryExecutionResult::with_affected(self.rows.len() as u64, 1)
        } else {
            QueryExecutionResult::with_rows(self.rows.clone(), 1)
        }
    }

    async fn begin_tx(&self, _ctx: &CancellationToken) -> Result<Box<dyn DriverTx>> {
        Ok(Box::new(MockTx {
            rows: self.rows.clone(),
        }))
    }

    async fn get_schema(
        &self,
        _ctx: &CancellationToken,
        selected: &SelectedTables,
    ) -> Result<SchemaInfo> {
        Ok(self.schema.filtered(selected))
    }

    async fn fetch_example_records(
        &self,
        _ctx: &CancellationToken,
        _table: &str,
        limit: usize,
    ) -> Result<Vec<RowMap>> {
        Ok(self.rows.iter().take(limit).cloned().collect())
    }
}

struct MockTx {
    rows: Vec<RowMap>,
}

#[async_trait]
impl DriverTx for MockTx {
    async fn execute(
        &mut self,
        _ctx: &CancellationToken,
        _query: &str,
        query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        if query_type.is_mutating() {
            QueryExecutionResult::with_affected(self.rows.len() as u64, 1)
        } else {
            QueryExecutionResult::with_rows(self.rows.clone(), 1)
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Driver that fails every operation, for error-path tests.
pub struct FailingDriver {
    /// Error code returned by query executions.
    pub code: QueryErrorCode,
}

impl Default for FailingDriver {
    fn default() -> Self {
        Self {
            code: QueryErrorCode::ConnectionLost,
        }
    }
}

#[async_trait]
impl DatabaseDriver for FailingDriver {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Err(NeoBaseError::connection_lost("failing driver"))
    }

    async fn execute_query(
        &self,
        _ctx: &CancellationToken,
        _query: &str,
        _query_type: QueryType,
        _find_count: bool,
    ) -> QueryExecutionResult {
        QueryExecutionResult::failed(QueryError::new(self.code, "failing driver"), 0)
    }

    async fn begin_tx(&self, _ctx: &CancellationToken) -> Result<Box<dyn DriverTx>> {
        Err(NeoBaseError::connection_lost("failing driver"))
    }

    async fn get_schema(
        &self,
        _ctx: &CancellationToken,
        _selected: &SelectedTables,
    ) -> Result<SchemaInfo> {
        Err(NeoBaseError::connection_lost("failing driver"))
    }

    async fn fetch_example_records(
        &self,
        _ctx: &CancellationToken,
        _table: &str,
        _limit: usize,
    ) -> Result<Vec<RowMap>> {
        Err(NeoBaseError::connection_lost("failing driver"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_driver_records_queries() {
        let driver = MockDriver::new();
        let ctx = CancellationToken::new();
        let result = driver
            .execute_query(&ctx, "SELECT * FROM users", QueryType::Read, false)
            .await;
        assert_eq!(result.rows.len(), 2);
        assert_eq!(driver.executed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_driver_liveness() {
        let driver = MockDriver::new();
        assert!(driver.is_alive().await);
        driver.kill();
        assert!(!driver.is_alive().await);
    }

    #[tokio::test]
    async fn test_failing_driver() {
        let driver = FailingDriver::default();
        let ctx = CancellationToken::new();
        let result = driver
            .execute_query(&ctx, "SELECT 1", QueryType::Read, false)
            .await;
        assert!(result.is_error());
        assert!(driver.get_schema(&ctx, &SelectedTables::All).await.is_err());
    }
}
