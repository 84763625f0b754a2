//! Integration tests for the NeoBase core.
//!
//! Driven through the public API with the mock driver and mock LLM
//! client, so they run without databases or network.

mod chat_test;
mod crypto_test;
mod merge_test;
mod schema_test;
mod stream_test;

use std::sync::Arc;
use std::time::Duration;

use neobase::chat::ChatService;
use neobase::db::{DatabaseDriver, DbManager, DriverFactory, DriverRegistry, MockDriver};
use neobase::llm::{LlmClient, LlmManager};
use neobase::models::{Chat, ChatSettings, Connection, SelectedTables, StandardConnection};
use neobase::storage::{ChatStore, MemoryStores, Stores};
use neobase::stream::StreamHub;
use neobase::Result;

pub struct MockDriverFactory;

#[async_trait::async_trait]
impl DriverFactory for MockDriverFactory {
    async fn connect(
        &self,
        _conn: &Connection,
        _chat_id: &str,
    ) -> Result<Box<dyn DatabaseDriver>> {
        Ok(Box::new(MockDriver::new()))
    }
}

pub fn postgres_connection() -> Connection {
    Connection::Postgres(StandardConnection {
        host: "localhost".into(),
        port: 5432,
        username: "neo".into(),
        password: None,
        database: "app".into(),
        use_ssl: false,
        ssh_private_key: None,
    })
}

pub struct TestCore {
    pub service: Arc<ChatService>,
    pub hub: Arc<StreamHub>,
    pub stores: Stores,
    pub db: Arc<DbManager>,
}

/// Builds a service over the mock driver, the given LLM client, and
/// in-memory stores, with chat `c1` owned by user `u1` connected.
pub async fn test_core(llm_client: Arc<dyn LlmClient>, settings: ChatSettings) -> TestCore {
    let mut registry = DriverRegistry::new();
    registry.register(
        neobase::db::DatabaseType::Postgres,
        Arc::new(MockDriverFactory),
    );
    let db = Arc::new(DbManager::new(registry));

    let hub = StreamHub::new(Duration::from_secs(300));
    db.set_stream_notifier(hub.clone());

    let stores = MemoryStores::new().into_stores();
    let chat = Chat {
        id: "c1".into(),
        user_id: "u1".into(),
        connection: postgres_connection(),
        selected_tables: SelectedTables::All,
        settings,
        model_id: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    stores.chats.insert(&chat).await.unwrap();
    db.connect("c1", chat.connection.clone()).await.unwrap();

    let service = Arc::new(ChatService::new(
        db.clone(),
        Arc::new(LlmManager::mock(llm_client)),
        hub.clone(),
        stores.clone(),
        Duration::from_secs(60),
    ));

    TestCore {
        service,
        hub,
        stores,
        db,
    }
}
