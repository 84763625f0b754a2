//! In-memory repository implementations.
//!
//! Back the services in tests and make the orchestrator runnable
//! without a document store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::llm::LlmMessage;
use crate::models::{Chat, Message, User, Visualization};
use crate::storage::{
    ChatStore, LlmMessageStore, MessageStore, Stores, UserStore, VisualizationStore,
};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    chats: HashMap<String, Chat>,
    messages: Vec<Message>,
    llm_messages: Vec<LlmMessage>,
    visualizations: HashMap<String, Visualization>,
}

/// All repositories over one shared in-memory state.
#[derive(Clone, Default)]
pub struct MemoryStores {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStores {
    /// Creates empty stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundles this instance into the `Stores` set.
    pub fn into_stores(self) -> Stores {
        let shared = Arc::new(self);
        Stores {
            users: shared.clone(),
            chats: shared.clone(),
            messages: shared.clone(),
            llm_messages: shared.clone(),
            visualizations: shared,
        }
    }
}

#[async_trait]
impl UserStore for MemoryStores {
    async fn insert(&self, user: &User) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .users
            .insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<User>> {
        Ok(self.inner.lock().expect("memory store lock").users.get(id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .inner
            .lock()
            .expect("memory store lock")
            .users
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn update(&self, user: &User) -> Result<()> {
        UserStore::insert(self, user).await
    }
}

#[async_trait]
impl ChatStore for MemoryStores {
    async fn insert(&self, chat: &Chat) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .chats
            .insert(chat.id.clone(), chat.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Chat>> {
        Ok(self.inner.lock().expect("memory store lock").chats.get(id).cloned())
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        let mut chats: Vec<Chat> = self
            .inner
            .lock()
            .expect("memory store lock")
            .chats
            .values()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn update(&self, chat: &Chat) -> Result<()> {
        ChatStore::insert(self, chat).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.inner.lock().expect("memory store lock").chats.remove(id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStores {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .messages
            .push(message.clone());
        Ok(())
    }

    async fn get(&self, chat_id: &str, message_id: &str) -> Result<Option<Message>> {
        Ok(self
            .inner
            .lock()
            .expect("memory store lock")
            .messages
            .iter()
            .find(|m| m.chat_id == chat_id && m.id == message_id)
            .cloned())
    }

    async fn update(&self, message: &Message) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        if let Some(slot) = inner.messages.iter_mut().find(|m| m.id == message.id) {
            *slot = message.clone();
        }
        Ok(())
    }

    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>> {
        let inner = self.inner.lock().expect("memory store lock");
        let mut messages: Vec<Message> = inner
            .messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn find_assistant_for(
        &self,
        chat_id: &str,
        user_message_id: &str,
    ) -> Result<Option<Message>> {
        let inner = self.inner.lock().expect("memory store lock");
        Ok(inner
            .messages
            .iter()
            .filter(|m| {
                m.chat_id == chat_id && m.user_message_id.as_deref() == Some(user_message_id)
            })
            .max_by_key(|m| m.created_at)
            .cloned())
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .messages
            .retain(|m| m.chat_id != chat_id);
        Ok(())
    }
}

#[async_trait]
impl LlmMessageStore for MemoryStores {
    async fn append(&self, message: &LlmMessage) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .llm_messages
            .push(message.clone());
        Ok(())
    }

    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<LlmMessage>> {
        let inner = self.inner.lock().expect("memory store lock");
        let mut entries: Vec<LlmMessage> = inner
            .llm_messages
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }

    async fn replace_for_message(&self, message: &LlmMessage) -> Result<()> {
        let mut inner = self.inner.lock().expect("memory store lock");
        inner
            .llm_messages
            .retain(|m| m.message_id != message.message_id);
        inner.llm_messages.push(message.clone());
        Ok(())
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .llm_messages
            .retain(|m| m.chat_id != chat_id);
        Ok(())
    }
}

#[async_trait]
impl VisualizationStore for MemoryStores {
    async fn insert(&self, viz: &Visualization) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .visualizations
            .insert(viz.id.clone(), viz.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Visualization>> {
        Ok(self
            .inner
            .lock()
            .expect("memory store lock")
            .visualizations
            .get(id)
            .cloned())
    }

    async fn list_for_message(&self, message_id: &str) -> Result<Vec<Visualization>> {
        Ok(self
            .inner
            .lock()
            .expect("memory store lock")
            .visualizations
            .values()
            .filter(|v| v.message_id == message_id)
            .cloned()
            .collect())
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.inner
            .lock()
            .expect("memory store lock")
            .visualizations
            .retain(|_, v| v.chat_id != chat_id);
        Ok(())
    }
}
