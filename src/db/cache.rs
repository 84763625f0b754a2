//! Per-connection schema cache.
//!
//! Snapshots are immutable once stored; replacing the `Arc` is the
//! atomic swap that invalidation relies on. Checksum comparison gives
//! cheap drift detection without re-rendering prompts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use crate::db::SchemaInfo;

/// One cached snapshot.
pub struct CachedSchema {
    pub schema: Arc<SchemaInfo>,
    pub checksums: BTreeMap<String, String>,
    pub fetched_at: Instant,
}

/// Process-wide schema cache keyed by chat id.
#[derive(Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<String, Arc<CachedSchema>>>,
}

impl SchemaCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached snapshot for a chat, if any.
    pub fn get(&self, chat_id: &str) -> Option<Arc<CachedSchema>> {
        self.entries
            .read()
            .expect("schema cache lock")
            .get(chat_id)
            .cloned()
    }

    /// Stores a fresh snapshot, replacing any previous one.
    pub fn put(&self, chat_id: &str, schema: SchemaInfo) -> Arc<CachedSchema> {
        let entry = Arc::new(CachedSchema {
            checksums: schema.checksums(),
            schema: Arc::new(schema),
            fetched_at: Instant::now(),
        });
        self.entries
            .write()
            .expect("schema cache lock")
            .insert(chat_id.to_string(), entry.clone());
        entry
    }

    /// Drops the snapshot for a chat.
    pub fn invalidate(&self, chat_id: &str) {
        self.entries
            .write()
            .expect("schema cache lock")
            .remove(chat_id);
    }

    /// Names of tables whose checksum differs between a cached snapshot
    /// and a fresh one (added and removed tables included).
    pub fn changed_tables(
        cached: &BTreeMap<String, String>,
        fresh: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut changed = Vec::new();
        for (table, checksum) in fresh {
            if cached.get(table) != Some(checksum) {
                changed.push(table.clone());
            }
        }
        for table in cached.keys() {
            if !fresh.contains_key(table) {
                changed.push(table.clone());
            }
        }
        changed.sort();
        changed.dedup();
        changed
    }
}
