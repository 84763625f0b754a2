//! Database abstraction layer.
//!
//! Provides a trait-based uniform execution surface over the supported
//! engines, a driver factory registry, a schema fetch/cache layer, and
//! the per-chat connection manager.

mod cache;
mod clickhouse;
mod manager;
mod mock;
mod mongodb;
mod mysql;
pub(crate) mod postgres;
mod schema;
mod spreadsheet;
mod types;

pub use cache::{CachedSchema, SchemaCache};
pub use clickhouse::ClickHouseDriver;
pub use manager::{ConnectionStatus, DbManager, StreamNotifier};
pub use mock::{FailingDriver, MockDriver};
pub use mongodb::MongoDriver;
pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use schema::{
    row_count_bucket, ColumnSchema, ForeignKeySchema, IndexSchema, SchemaInfo, TableSchema,
};
pub use spreadsheet::{SpreadsheetDriver, SpreadsheetStore};
pub use types::{QueryError, QueryErrorCode, QueryExecutionResult, QueryType, RowMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{NeoBaseError, Result};
use crate::models::{Connection, SelectedTables};

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    Postgres,
    Yugabyte,
    MySql,
    ClickHouse,
    MongoDb,
    Spreadsheet,
    GoogleSheets,
}

impl DatabaseType {
    /// Returns the type as a string for persistence and prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Yugabyte => "yugabyte",
            Self::MySql => "mysql",
            Self::ClickHouse => "clickhouse",
            Self::MongoDb => "mongodb",
            Self::Spreadsheet => "spreadsheet",
            Self::GoogleSheets => "google_sheets",
        }
    }

    /// Parses a type from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "yugabyte" | "yugabytedb" => Some(Self::Yugabyte),
            "mysql" => Some(Self::MySql),
            "clickhouse" => Some(Self::ClickHouse),
            "mongodb" | "mongo" => Some(Self::MongoDb),
            "spreadsheet" => Some(Self::Spreadsheet),
            "google_sheets" | "google-sheets" => Some(Self::GoogleSheets),
            _ => None,
        }
    }

    /// Returns the SQL dialect family used in prompts, or `None` for
    /// non-SQL engines.
    pub fn sql_dialect(&self) -> Option<&'static str> {
        match self {
            Self::Postgres | Self::Yugabyte | Self::Spreadsheet | Self::GoogleSheets => {
                Some("PostgreSQL")
            }
            Self::MySql => Some("MySQL"),
            Self::ClickHouse => Some("ClickHouse SQL"),
            Self::MongoDb => None,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An open transaction on a driver.
///
/// Writes run inside one of these by default; commit and rollback
/// consume the transaction so it cannot be reused on either path.
#[async_trait]
pub trait DriverTx: Send {
    /// Executes a query inside this transaction.
    async fn execute(
        &mut self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        find_count: bool,
    ) -> QueryExecutionResult;

    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rolls the transaction back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Uniform capability set every driver implements.
///
/// Connecting is the factory's job (`DriverFactory::connect`); a value
/// of this trait is always backed by a live pool or client. Drivers
/// never interpret query text beyond dialect-appropriate parameter
/// binding; the text is passed through verbatim.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// The engine behind this driver.
    fn database_type(&self) -> DatabaseType;

    /// Closes the connection and releases resources.
    async fn disconnect(&self) -> Result<()>;

    /// Round-trips to the engine.
    async fn ping(&self) -> Result<()>;

    /// Cheap liveness check used by the heartbeat.
    async fn is_alive(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Executes a single query outside any wrapping transaction.
    ///
    /// `find_count` asks document drivers to also report a matched
    /// count where the operation supports it.
    async fn execute_query(
        &self,
        ctx: &CancellationToken,
        query: &str,
        query_type: QueryType,
        find_count: bool,
    ) -> QueryExecutionResult;

    /// Opens a transaction. Engines without transaction support return
    /// a pass-through implementation and document the gap.
    async fn begin_tx(&self, ctx: &CancellationToken) -> Result<Box<dyn DriverTx>>;

    /// Introspects the schema, restricted to the selected tables.
    async fn get_schema(
        &self,
        ctx: &CancellationToken,
        selected: &SelectedTables,
    ) -> Result<SchemaInfo>;

    /// Returns the drift-detection checksum for one table.
    async fn get_table_checksum(&self, ctx: &CancellationToken, table: &str) -> Result<String> {
        let schema = self
            .get_schema(ctx, &SelectedTables::Listed(vec![table.to_string()]))
            .await?;
        schema
            .tables
            .get(table)
            .map(TableSchema::checksum)
            .ok_or_else(|| NeoBaseError::query(format!("Table '{table}' not found")))
    }

    /// Samples up to `limit` records from a table.
    async fn fetch_example_records(
        &self,
        ctx: &CancellationToken,
        table: &str,
        limit: usize,
    ) -> Result<Vec<RowMap>>;

    /// Destroys all data the driver provisioned for this connection.
    /// Only the spreadsheet driver has anything to tear down.
    async fn delete_connection_data(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

/// Creates connected drivers for one engine kind.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn connect(&self, conn: &Connection, chat_id: &str) -> Result<Box<dyn DatabaseDriver>>;
}

/// Registry of driver factories, immutable after initialization.
pub struct DriverRegistry {
    factories: HashMap<DatabaseType, Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Creates a registry with all built-in external-database drivers.
    ///
    /// The spreadsheet factory is registered separately because it
    /// needs the shared store handle.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(DatabaseType::Postgres, Arc::new(postgres::PostgresFactory));
        registry.register(DatabaseType::Yugabyte, Arc::new(postgres::PostgresFactory));
        registry.register(DatabaseType::MySql, Arc::new(mysql::MySqlFactory));
        registry.register(
            DatabaseType::ClickHouse,
            Arc::new(clickhouse::ClickHouseFactory),
        );
        registry.register(DatabaseType::MongoDb, Arc::new(mongodb::MongoFactory));
        registry
    }

    /// Registers a factory for an engine kind, replacing any existing
    /// one.
    pub fn register(&mut self, db_type: DatabaseType, factory: Arc<dyn DriverFactory>) {
        self.factories.insert(db_type, factory);
    }

    /// Registers the spreadsheet factory for both spreadsheet-backed
    /// connection kinds.
    pub fn register_spreadsheet(&mut self, store: Arc<SpreadsheetStore>) {
        let factory = Arc::new(spreadsheet::SpreadsheetFactory::new(store));
        self.register(DatabaseType::Spreadsheet, factory.clone());
        self.register(DatabaseType::GoogleSheets, factory);
    }

    /// Connects a driver for the given connection.
    pub async fn connect(
        &self,
        conn: &Connection,
        chat_id: &str,
    ) -> Result<Box<dyn DatabaseDriver>> {
        let db_type = conn.database_type();
        let factory = self.factories.get(&db_type).ok_or_else(|| {
            NeoBaseError::config(format!("No driver registered for {db_type}"))
        })?;
        factory.connect(conn, chat_id).await
    }

    /// Returns true if a factory is registered for the given kind.
    pub fn supports(&self, db_type: DatabaseType) -> bool {
        self.factories.contains_key(&db_type)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Races a driver future against the request's cancellation signal.
pub(crate) async fn run_cancellable<F, T>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(NeoBaseError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_type_round_trip() {
        for db_type in [
            DatabaseType::Postgres,
            DatabaseType::Yugabyte,
            DatabaseType::MySql,
            DatabaseType::ClickHouse,
            DatabaseType::MongoDb,
            DatabaseType::Spreadsheet,
            DatabaseType::GoogleSheets,
        ] {
            assert_eq!(DatabaseType::parse(db_type.as_str()), Some(db_type));
        }
        assert_eq!(DatabaseType::parse("oracle"), None);
    }

    #[test]
    fn test_sql_dialects() {
        assert_eq!(DatabaseType::Postgres.sql_dialect(), Some("PostgreSQL"));
        assert_eq!(DatabaseType::Spreadsheet.sql_dialect(), Some("PostgreSQL"));
        assert_eq!(DatabaseType::MongoDb.sql_dialect(), None);
    }

    #[test]
    fn test_default_registry_covers_external_engines() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.supports(DatabaseType::Postgres));
        assert!(registry.supports(DatabaseType::Yugabyte));
        assert!(registry.supports(DatabaseType::MySql));
        assert!(registry.supports(DatabaseType::ClickHouse));
        assert!(registry.supports(DatabaseType::MongoDb));
        // Spreadsheet needs the shared store and is registered later.
        assert!(!registry.supports(DatabaseType::Spreadsheet));
    }

    #[tokio::test]
    async fn test_run_cancellable_short_circuits() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = run_cancellable(&ctx, async {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok::<_, NeoBaseError>(1)
        })
        .await;
        assert!(matches!(result, Err(NeoBaseError::Cancelled)));
    }
}
