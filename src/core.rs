//! Composition root.
//!
//! Builds the process-wide components in dependency order, performs
//! the two-phase wiring between the DB manager and the stream hub, and
//! owns the background tasks' stop tokens.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::chat::ChatService;
use crate::config::AppConfig;
use crate::crypto::FieldCipher;
use crate::db::{DbManager, DriverRegistry, SpreadsheetStore};
use crate::error::Result;
use crate::llm::LlmManager;
use crate::spreadsheet::SpreadsheetIngest;
use crate::storage::{MongoStores, RedisSessionStore, Stores};
use crate::stream::StreamHub;

/// The assembled backend core. HTTP and auth adapters hold one of
/// these and call into its services.
pub struct NeoBaseCore {
    pub config: AppConfig,
    pub db: Arc<DbManager>,
    pub llm: Arc<LlmManager>,
    pub hub: Arc<StreamHub>,
    pub chat: Arc<ChatService>,
    /// Present when the spreadsheet store is configured.
    pub ingest: Option<Arc<SpreadsheetIngest>>,
    pub stores: Stores,
    /// Present when a Redis URI is configured.
    pub sessions: Option<RedisSessionStore>,
    heartbeat_stop: CancellationToken,
    gc_stop: CancellationToken,
}

impl NeoBaseCore {
    /// Boots every component from the environment configuration.
    pub async fn init(config: AppConfig) -> Result<Self> {
        let credential_cipher = FieldCipher::from_base64_key(&config.schema_encryption_key)?;
        let data_cipher = FieldCipher::from_base64_key(&config.data_encryption_key)?;

        let mut registry = DriverRegistry::with_defaults();
        let mut spreadsheet_store = None;
        if let Some(store_config) = &config.spreadsheet_store {
            let store =
                Arc::new(SpreadsheetStore::connect(store_config, data_cipher.clone()).await?);
            registry.register_spreadsheet(store.clone());
            spreadsheet_store = Some(store);
        }

        let db = Arc::new(DbManager::new(registry));
        let llm = Arc::new(LlmManager::from_config(&config)?);
        let hub = StreamHub::new(config.stream_grace);

        // Two-phase wiring: the hub needs to exist before the manager
        // can push lifecycle events through it.
        db.set_stream_notifier(hub.clone());

        let mongo = MongoStores::connect(&config.mongo_uri, "neobase", credential_cipher).await?;
        let stores = mongo.into_stores();

        let sessions = match &config.redis_uri {
            Some(uri) => Some(RedisSessionStore::connect(uri).await?),
            None => None,
        };

        let chat = Arc::new(ChatService::new(
            db.clone(),
            llm.clone(),
            hub.clone(),
            stores.clone(),
            config.turn_deadline,
        ));

        let ingest = spreadsheet_store.map(|store| Arc::new(SpreadsheetIngest::new(store)));

        let heartbeat_stop = db.start_heartbeat(config.heartbeat_interval);
        let gc_stop = hub.start_gc(config.stream_grace);

        info!("NeoBase core initialized");
        Ok(Self {
            config,
            db,
            llm,
            hub,
            chat,
            ingest,
            stores,
            sessions,
            heartbeat_stop,
            gc_stop,
        })
    }

    /// Stops the background tasks. Connections close when the last
    /// reference drops.
    pub fn shutdown(&self) {
        self.heartbeat_stop.cancel();
        self.gc_stop.cancel();
        info!("NeoBase core shut down");
    }
}

impl Drop for NeoBaseCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
