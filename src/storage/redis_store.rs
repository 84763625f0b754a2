//! Redis-backed session and cache mirrors.
//!
//! Holds the transient state that should survive a process restart:
//! active stream-session descriptors, schema-cache snapshots, and
//! issued session tokens. Everything is stored with a TTL; Redis going
//! away degrades to cold caches, never to errors in the request path.

use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::db::SchemaInfo;
use crate::error::{NeoBaseError, Result};

const STREAM_KEY_PREFIX: &str = "neobase:stream:";
const SCHEMA_KEY_PREFIX: &str = "neobase:schema:";
const TOKEN_KEY_PREFIX: &str = "neobase:token:";

/// Persisted descriptor of an active stream session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSessionRecord {
    pub stream_id: String,
    pub chat_id: String,
    pub owner_user: String,
}

/// Key-value mirrors over one Redis connection.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisSessionStore {
    /// Connects to Redis.
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = redis::Client::open(uri)
            .map_err(|e| NeoBaseError::storage(format!("Invalid Redis URI: {e}")))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Cannot reach Redis: {e}")))?;
        info!("Key-value store connected");
        Ok(Self { conn })
    }

    /// Records an active stream session.
    pub async fn put_stream_session(
        &self,
        record: &StreamSessionRecord,
        ttl: Duration,
    ) -> Result<()> {
        let key = format!("{STREAM_KEY_PREFIX}{}", record.stream_id);
        let value = serde_json::to_string(record)
            .map_err(|e| NeoBaseError::internal(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis write failed: {e}")))
    }

    /// Looks up an active stream session.
    pub async fn get_stream_session(
        &self,
        stream_id: &str,
    ) -> Result<Option<StreamSessionRecord>> {
        let key = format!("{STREAM_KEY_PREFIX}{stream_id}");
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis read failed: {e}")))?;
        match value {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| NeoBaseError::internal(format!("corrupt session record: {e}"))),
            None => Ok(None),
        }
    }

    /// Removes a stream session.
    pub async fn delete_stream_session(&self, stream_id: &str) -> Result<()> {
        let key = format!("{STREAM_KEY_PREFIX}{stream_id}");
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis delete failed: {e}")))
    }

    /// Mirrors a schema snapshot.
    pub async fn cache_schema(
        &self,
        chat_id: &str,
        schema: &SchemaInfo,
        ttl: Duration,
    ) -> Result<()> {
        let key = format!("{SCHEMA_KEY_PREFIX}{chat_id}");
        let value = serde_json::to_string(schema)
            .map_err(|e| NeoBaseError::internal(e.to_string()))?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis write failed: {e}")))
    }

    /// Reads a mirrored schema snapshot.
    pub async fn get_cached_schema(&self, chat_id: &str) -> Result<Option<SchemaInfo>> {
        let key = format!("{SCHEMA_KEY_PREFIX}{chat_id}");
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis read failed: {e}")))?;
        match value {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| NeoBaseError::internal(format!("corrupt schema mirror: {e}"))),
            None => Ok(None),
        }
    }

    /// Drops a mirrored schema snapshot.
    pub async fn invalidate_schema(&self, chat_id: &str) -> Result<()> {
        let key = format!("{SCHEMA_KEY_PREFIX}{chat_id}");
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis delete failed: {e}")))
    }

    /// Stores a session token for a user.
    pub async fn put_session_token(
        &self,
        token: &str,
        user_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let key = format!("{TOKEN_KEY_PREFIX}{token}");
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, user_id, ttl.as_secs())
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis write failed: {e}")))
    }

    /// Resolves a session token to its user.
    pub async fn get_session_token(&self, token: &str) -> Result<Option<String>> {
        let key = format!("{TOKEN_KEY_PREFIX}{token}");
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis read failed: {e}")))
    }

    /// Revokes a session token.
    pub async fn delete_session_token(&self, token: &str) -> Result<()> {
        let key = format!("{TOKEN_KEY_PREFIX}{token}");
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Redis delete failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_round_trip() {
        let record = StreamSessionRecord {
            stream_id: "s1".into(),
            chat_id: "c1".into(),
            owner_user: "u1".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: StreamSessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_key_prefixes_are_disjoint() {
        let prefixes = [STREAM_KEY_PREFIX, SCHEMA_KEY_PREFIX, TOKEN_KEY_PREFIX];
        for (i, a) in prefixes.iter().enumerate() {
            for b in prefixes.iter().skip(i + 1) {
                assert!(!a.starts_with(b) && !b.starts_with(a));
            }
        }
    }
}
