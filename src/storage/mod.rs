//! Persistence layer: repository traits plus the MongoDB and Redis
//! implementations.
//!
//! The rest of the crate talks to these traits only; document shapes
//! and encryption of sensitive connection fields are storage-boundary
//! concerns handled inside the implementations.

mod memory;
mod mongo;
mod redis_store;

pub use memory::MemoryStores;
pub use mongo::MongoStores;
pub use redis_store::RedisSessionStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::llm::LlmMessage;
use crate::models::{Chat, Message, User, Visualization};

/// Users collection.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: &User) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<User>>;
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn update(&self, user: &User) -> Result<()>;
}

/// Chats collection.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn insert(&self, chat: &Chat) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Chat>>;
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>>;
    async fn update(&self, chat: &Chat) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

/// Messages collection.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<()>;
    async fn get(&self, chat_id: &str, message_id: &str) -> Result<Option<Message>>;
    async fn update(&self, message: &Message) -> Result<()>;
    /// Most recent messages, oldest first, bounded by `limit`.
    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>>;
    /// The assistant message answering the given user message, if any.
    async fn find_assistant_for(
        &self,
        chat_id: &str,
        user_message_id: &str,
    ) -> Result<Option<Message>>;
    async fn delete_for_chat(&self, chat_id: &str) -> Result<()>;
}

/// LLM conversation-history collection.
#[async_trait]
pub trait LlmMessageStore: Send + Sync {
    async fn append(&self, message: &LlmMessage) -> Result<()>;
    /// Most recent entries, oldest first, bounded by `limit`.
    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<LlmMessage>>;
    /// Replaces the history entry mirroring a chat message.
    async fn replace_for_message(&self, message: &LlmMessage) -> Result<()>;
    async fn delete_for_chat(&self, chat_id: &str) -> Result<()>;
}

/// Visualizations collection.
#[async_trait]
pub trait VisualizationStore: Send + Sync {
    async fn insert(&self, viz: &Visualization) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<Visualization>>;
    /// Legacy fallback: all visualizations attached to a message.
    async fn list_for_message(&self, message_id: &str) -> Result<Vec<Visualization>>;
    async fn delete_for_chat(&self, chat_id: &str) -> Result<()>;
}

/// The full set of repositories the services need.
#[derive(Clone)]
pub struct Stores {
    pub users: std::sync::Arc<dyn UserStore>,
    pub chats: std::sync::Arc<dyn ChatStore>,
    pub messages: std::sync::Arc<dyn MessageStore>,
    pub llm_messages: std::sync::Arc<dyn LlmMessageStore>,
    pub visualizations: std::sync::Arc<dyn VisualizationStore>,
}
