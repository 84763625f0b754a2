//! Connection manager: per-chat driver lifecycle, serialized execution,
//! transactional writes, heartbeat, and stream notifications.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{
    DatabaseDriver, DriverRegistry, QueryExecutionResult, QueryType, RowMap, SchemaCache,
    SchemaInfo,
};
use crate::error::{NeoBaseError, Result};
use crate::models::{Connection, SelectedTables};

/// Lifecycle state of a chat's connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Receives connection-lifecycle events for forwarding onto the chat's
/// stream. Implemented by the stream hub and wired in by the
/// composition root after both sides exist.
pub trait StreamNotifier: Send + Sync {
    /// The connection for `chat_id` came up.
    fn on_connected(&self, chat_id: &str);
    /// The connection for `chat_id` went down.
    fn on_disconnected(&self, chat_id: &str);
}

/// One chat's slot: the live driver plus the lock that serializes all
/// operations against it.
struct ChatConn {
    connection: Connection,
    driver: tokio::sync::Mutex<Box<dyn DatabaseDriver>>,
    status: RwLock<ConnectionStatus>,
}

impl ChatConn {
    fn status(&self) -> ConnectionStatus {
        *self.status.read().expect("status lock")
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write().expect("status lock") = status;
    }
}

/// Manages at most one live connection per chat over the driver
/// registry. Distinct chats operate fully in parallel; operations on a
/// single chat are serialized by the slot mutex.
pub struct DbManager {
    registry: DriverRegistry,
    connections: RwLock<HashMap<String, Arc<ChatConn>>>,
    schema_cache: SchemaCache,
    notifier: RwLock<Option<Arc<dyn StreamNotifier>>>,
}

impl DbManager {
    /// Creates a manager over the given registry.
    pub fn new(registry: DriverRegistry) -> Self {
        Self {
            registry,
            connections: RwLock::new(HashMap::new()),
            schema_cache: SchemaCache::new(),
            notifier: RwLock::new(None),
        }
    }

    /// Wires in the stream notifier. Second phase of construction; the
    /// hub is built after the manager.
    pub fn set_stream_notifier(&self, notifier: Arc<dyn StreamNotifier>) {
        *self.notifier.write().expect("notifier lock") = Some(notifier);
    }

    fn notify_connected(&self, chat_id: &str) {
        if let Some(n) = self.notifier.read().expect("notifier lock").as_ref() {
            n.on_connected(chat_id);
        }
    }

    fn notify_disconnected(&self, chat_id: &str) {
        if let Some(n) = self.notifier.read().expect("notifier lock").as_ref() {
            n.on_disconnected(chat_id);
        }
    }

    /// Opens (or replaces) the connection for a chat.
    pub async fn connect(&self, chat_id: &str, connection: Connection) -> Result<()> {
        let driver = self.registry.connect(&connection, chat_id).await?;

        let slot = Arc::new(ChatConn {
            connection,
            driver: tokio::sync::Mutex::new(driver),
            status: RwLock::new(ConnectionStatus::Connected),
        });

        let previous = self
            .connections
            .write()
            .expect("connections lock")
            .insert(chat_id.to_string(), slot);

        if let Some(old) = previous {
            let old_driver = old.driver.lock().await;
            let _ = old_driver.disconnect().await;
        }

        info!(chat_id, "Database connected");
        self.notify_connected(chat_id);
        Ok(())
    }

    /// Closes a chat's connection, leaving persisted data intact.
    pub async fn disconnect(&self, chat_id: &str) -> Result<()> {
        let slot = self
            .connections
            .write()
            .expect("connections lock")
            .remove(chat_id);

        if let Some(slot) = slot {
            let driver = slot.driver.lock().await;
            driver.disconnect().await?;
            self.schema_cache.invalidate(chat_id);
            info!(chat_id, "Database disconnected");
            self.notify_disconnected(chat_id);
        }
        Ok(())
    }

    /// Returns the status of a chat's slot.
    pub fn status(&self, chat_id: &str) -> Option<ConnectionStatus> {
        self.connections
            .read()
            .expect("connections lock")
            .get(chat_id)
            .map(|slot| slot.status())
    }

    /// Returns true if the chat currently has a live connection.
    pub fn is_connected(&self, chat_id: &str) -> bool {
        self.status(chat_id) == Some(ConnectionStatus::Connected)
    }

    fn slot(&self, chat_id: &str) -> Result<Arc<ChatConn>> {
        self.connections
            .read()
            .expect("connections lock")
            .get(chat_id)
            .cloned()
            .ok_or_else(|| {
                NeoBaseError::connection("Not connected. Connect to the database first.")
            })
    }

    /// Executes one query for a chat, serialized with every other
    /// operation on that chat's connection.
    ///
    /// Mutating queries run in a transaction: commit on success,
    /// rollback on failure, so a failed write has no partial effect.
    /// Transient failures trigger a single reconnect attempt before the
    /// structured error is surfaced; the query itself is never retried.
    pub async fn execute_query(
        &self,
        ctx: &CancellationToken,
        chat_id: &str,
        query: &str,
        query_type: QueryType,
        find_count: bool,
    ) -> Result<QueryExecutionResult> {
        let slot = self.slot(chat_id)?;
        let mut driver = slot.driver.lock().await;

        let result = if query_type.is_mutating() {
            let mut tx = driver.begin_tx(ctx).await?;
            let result = tx.execute(ctx, query, query_type, find_count).await;
            if result.is_error() {
                if let Err(e) = tx.rollback().await {
                    warn!(chat_id, "rollback after failed write also failed: {e}");
                }
            } else {
                tx.commit().await?;
            }
            result
        } else {
            driver.execute_query(ctx, query, query_type, find_count).await
        };

        if let Some(error) = &result.error {
            if error.code.is_transient() {
                self.try_reconnect(chat_id, &slot, &mut driver).await;
            }
        }

        Ok(result)
    }

    /// One reconnect attempt after a transient failure. On success the
    /// slot driver is replaced; on failure the slot is downgraded and
    /// `db-disconnected` is emitted.
    async fn try_reconnect(
        &self,
        chat_id: &str,
        slot: &ChatConn,
        driver: &mut Box<dyn DatabaseDriver>,
    ) {
        debug!(chat_id, "Transient failure, attempting reconnect");
        match self.registry.connect(&slot.connection, chat_id).await {
            Ok(fresh) => {
                let _ = driver.disconnect().await;
                *driver = fresh;
                slot.set_status(ConnectionStatus::Connected);
                info!(chat_id, "Reconnected after transient failure");
            }
            Err(e) => {
                warn!(chat_id, "Reconnect failed: {e}");
                slot.set_status(ConnectionStatus::Disconnected);
                self.notify_disconnected(chat_id);
            }
        }
    }

    /// Returns the schema snapshot for a chat, fetching on a cold cache
    /// or when `force_refresh` is set. The selected-tables filter is
    /// applied to the returned copy, not the cached one.
    pub async fn get_schema(
        &self,
        ctx: &CancellationToken,
        chat_id: &str,
        selected: &SelectedTables,
        force_refresh: bool,
    ) -> Result<Arc<SchemaInfo>> {
        if !force_refresh {
            if let Some(cached) = self.schema_cache.get(chat_id) {
                return Ok(match selected {
                    SelectedTables::All => cached.schema.clone(),
                    filter => Arc::new(cached.schema.filtered(filter)),
                });
            }
        }

        let slot = self.slot(chat_id)?;
        let driver = slot.driver.lock().await;
        let full = driver.get_schema(ctx, &SelectedTables::All).await?;
        drop(driver);

        let entry = self.schema_cache.put(chat_id, full);
        Ok(match selected {
            SelectedTables::All => entry.schema.clone(),
            filter => Arc::new(entry.schema.filtered(filter)),
        })
    }

    /// Checks for schema drift since the cached snapshot. Returns the
    /// changed table names (empty when the cache was cold or nothing
    /// moved) and refreshes the cache.
    pub async fn detect_schema_drift(
        &self,
        ctx: &CancellationToken,
        chat_id: &str,
    ) -> Result<Vec<String>> {
        let cached = self.schema_cache.get(chat_id);

        let slot = self.slot(chat_id)?;
        let driver = slot.driver.lock().await;
        let fresh = driver.get_schema(ctx, &SelectedTables::All).await?;
        drop(driver);

        let entry = self.schema_cache.put(chat_id, fresh);
        Ok(match cached {
            Some(old) => SchemaCache::changed_tables(&old.checksums, &entry.checksums),
            None => Vec::new(),
        })
    }

    /// Invalidates the cached schema for a chat.
    pub fn invalidate_schema(&self, chat_id: &str) {
        self.schema_cache.invalidate(chat_id);
    }

    /// Samples example records from one table.
    pub async fn fetch_example_records(
        &self,
        ctx: &CancellationToken,
        chat_id: &str,
        table: &str,
        limit: usize,
    ) -> Result<Vec<RowMap>> {
        let slot = self.slot(chat_id)?;
        let driver = slot.driver.lock().await;
        driver.fetch_example_records(ctx, table, limit).await
    }

    /// Tears down driver-provisioned data for a chat (the spreadsheet
    /// schema drop) and closes the connection.
    pub async fn delete_connection_data(
        &self,
        ctx: &CancellationToken,
        chat_id: &str,
    ) -> Result<()> {
        let slot = self
            .connections
            .write()
            .expect("connections lock")
            .remove(chat_id);

        if let Some(slot) = slot {
            let driver = slot.driver.lock().await;
            driver.delete_connection_data(ctx).await?;
            let _ = driver.disconnect().await;
            self.schema_cache.invalidate(chat_id);
        }
        Ok(())
    }

    /// Runs one heartbeat sweep: pings every slot and downgrades the
    /// ones that fail.
    pub async fn heartbeat_sweep(&self) {
        let slots: Vec<(String, Arc<ChatConn>)> = self
            .connections
            .read()
            .expect("connections lock")
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        for (chat_id, slot) in slots {
            let driver = slot.driver.lock().await;
            let alive = driver.is_alive().await;
            drop(driver);

            match (alive, slot.status()) {
                (false, ConnectionStatus::Connected) => {
                    warn!(chat_id, "Heartbeat failed, marking disconnected");
                    slot.set_status(ConnectionStatus::Disconnected);
                    self.notify_disconnected(&chat_id);
                }
                (true, ConnectionStatus::Disconnected) => {
                    slot.set_status(ConnectionStatus::Connected);
                    self.notify_connected(&chat_id);
                }
                _ => {}
            }
        }
    }

    /// Spawns the heartbeat loop at the given cadence. The task stops
    /// when the returned token is cancelled.
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> CancellationToken {
        let token = CancellationToken::new();
        let stop = token.clone();
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => manager.heartbeat_sweep().await,
                }
            }
        });

        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseType, DriverFactory, MockDriver};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockFactory;

    #[async_trait]
    impl DriverFactory for MockFactory {
        async fn connect(
            &self,
            _conn: &Connection,
            _chat_id: &str,
        ) -> Result<Box<dyn DatabaseDriver>> {
            Ok(Box::new(MockDriver::new()))
        }
    }

    #[derive(Default)]
    struct CountingNotifier {
        connected: AtomicUsize,
        disconnected: AtomicUsize,
    }

    impl StreamNotifier for CountingNotifier {
        fn on_connected(&self, _chat_id: &str) {
            self.connected.fetch_add(1, Ordering::SeqCst);
        }
        fn on_disconnected(&self, _chat_id: &str) {
            self.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager_with_mock() -> DbManager {
        let mut registry = DriverRegistry::new();
        registry.register(DatabaseType::Postgres, Arc::new(MockFactory));
        DbManager::new(registry)
    }

    fn postgres_connection() -> Connection {
        Connection::Postgres(crate::models::StandardConnection {
            host: "localhost".into(),
            port: 5432,
            username: "neo".into(),
            password: None,
            database: "app".into(),
            use_ssl: false,
            ssh_private_key: None,
        })
    }

    #[tokio::test]
    async fn test_connect_execute_disconnect() {
        let manager = manager_with_mock();
        let notifier = Arc::new(CountingNotifier::default());
        manager.set_stream_notifier(notifier.clone());

        manager
            .connect("c1", postgres_connection())
            .await
            .unwrap();
        assert!(manager.is_connected("c1"));
        assert_eq!(notifier.connected.load(Ordering::SeqCst), 1);

        let ctx = CancellationToken::new();
        let result = manager
            .execute_query(&ctx, "c1", "SELECT * FROM users", QueryType::Read, false)
            .await
            .unwrap();
        assert_eq!(result.rows.len(), 2);

        manager.disconnect("c1").await.unwrap();
        assert!(!manager.is_connected("c1"));
        assert_eq!(notifier.disconnected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_without_connection_fails() {
        let manager = manager_with_mock();
        let ctx = CancellationToken::new();
        let err = manager
            .execute_query(&ctx, "nope", "SELECT 1", QueryType::Read, false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
    }

    #[tokio::test]
    async fn test_schema_is_cached() {
        let manager = manager_with_mock();
        manager
            .connect("c1", postgres_connection())
            .await
            .unwrap();
        let ctx = CancellationToken::new();

        let first = manager
            .get_schema(&ctx, "c1", &SelectedTables::All, false)
            .await
            .unwrap();
        let second = manager
            .get_schema(&ctx, "c1", &SelectedTables::All, false)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.invalidate_schema("c1");
        let third = manager
            .get_schema(&ctx, "c1", &SelectedTables::All, false)
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[tokio::test]
    async fn test_selected_tables_filter_applied() {
        let manager = manager_with_mock();
        manager
            .connect("c1", postgres_connection())
            .await
            .unwrap();
        let ctx = CancellationToken::new();

        let filtered = manager
            .get_schema(
                &ctx,
                "c1",
                &SelectedTables::Listed(vec!["missing".into()]),
                false,
            )
            .await
            .unwrap();
        assert!(filtered.tables.is_empty());
    }

    #[tokio::test]
    async fn test_writes_run_in_transaction() {
        let manager = manager_with_mock();
        manager
            .connect("c1", postgres_connection())
            .await
            .unwrap();
        let ctx = CancellationToken::new();

        let result = manager
            .execute_query(
                &ctx,
                "c1",
                "UPDATE users SET name = 'x'",
                QueryType::Write,
                false,
            )
            .await
            .unwrap();
        assert_eq!(result.affected_rows, Some(2));
    }
}
