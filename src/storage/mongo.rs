//! MongoDB repository implementations.
//!
//! Documents are the serde form of the model types. Sensitive
//! connection fields are encrypted here, at the storage boundary, and
//! decrypted on the way out; nothing else in the crate sees
//! ciphertext.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Client, Database};
use tracing::info;

use crate::crypto::FieldCipher;
use crate::error::{NeoBaseError, Result};
use crate::llm::LlmMessage;
use crate::models::{Chat, Connection, Message, User, Visualization};
use crate::storage::{
    ChatStore, LlmMessageStore, MessageStore, Stores, UserStore, VisualizationStore,
};

fn storage_err(e: mongodb::error::Error) -> NeoBaseError {
    NeoBaseError::storage(e.to_string())
}

/// All repositories over one MongoDB database.
#[derive(Clone)]
pub struct MongoStores {
    db: Database,
    cipher: FieldCipher,
}

impl MongoStores {
    /// Connects to the document store.
    pub async fn connect(uri: &str, database: &str, cipher: FieldCipher) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| NeoBaseError::storage(format!("Invalid MongoDB URI: {e}")))?;
        let db = client.database(database);

        // Surface a bad URI now rather than on the first request.
        db.run_command(doc! {"ping": 1})
            .await
            .map_err(|e| NeoBaseError::storage(format!("Cannot reach MongoDB: {e}")))?;

        info!(database, "Document store connected");
        Ok(Self { db, cipher })
    }

    /// Bundles this instance into the `Stores` set.
    pub fn into_stores(self) -> Stores {
        let shared = std::sync::Arc::new(self);
        Stores {
            users: shared.clone(),
            chats: shared.clone(),
            messages: shared.clone(),
            llm_messages: shared.clone(),
            visualizations: shared,
        }
    }

    fn encrypt_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut out = connection.clone();
        match &mut out {
            Connection::Postgres(c)
            | Connection::Yugabyte(c)
            | Connection::Mysql(c)
            | Connection::Clickhouse(c)
            | Connection::Mongodb(c) => {
                if let Some(password) = &c.password {
                    c.password = Some(self.cipher.encrypt(password)?);
                }
                if let Some(key) = &c.ssh_private_key {
                    c.ssh_private_key = Some(self.cipher.encrypt(key)?);
                }
            }
            Connection::GoogleSheets(g) => {
                if let Some(token) = &g.access_token {
                    g.access_token = Some(self.cipher.encrypt(token)?);
                }
                if let Some(token) = &g.refresh_token {
                    g.refresh_token = Some(self.cipher.encrypt(token)?);
                }
            }
            Connection::Spreadsheet => {}
        }
        Ok(out)
    }

    fn decrypt_connection(&self, connection: &Connection) -> Result<Connection> {
        let mut out = connection.clone();
        match &mut out {
            Connection::Postgres(c)
            | Connection::Yugabyte(c)
            | Connection::Mysql(c)
            | Connection::Clickhouse(c)
            | Connection::Mongodb(c) => {
                if let Some(password) = &c.password {
                    c.password = Some(self.cipher.decrypt(password)?);
                }
                if let Some(key) = &c.ssh_private_key {
                    c.ssh_private_key = Some(self.cipher.decrypt(key)?);
                }
            }
            Connection::GoogleSheets(g) => {
                if let Some(token) = &g.access_token {
                    g.access_token = Some(self.cipher.decrypt(token)?);
                }
                if let Some(token) = &g.refresh_token {
                    g.refresh_token = Some(self.cipher.decrypt(token)?);
                }
            }
            Connection::Spreadsheet => {}
        }
        Ok(out)
    }
}

#[async_trait]
impl UserStore for MongoStores {
    async fn insert(&self, user: &User) -> Result<()> {
        self.db
            .collection::<User>("users")
            .insert_one(user)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn get(&self, id: &str) -> Result<Option<User>> {
        self.db
            .collection::<User>("users")
            .find_one(doc! {"id": id})
            .await
            .map_err(storage_err)
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        self.db
            .collection::<User>("users")
            .find_one(doc! {"email": email})
            .await
            .map_err(storage_err)
    }

    async fn update(&self, user: &User) -> Result<()> {
        self.db
            .collection::<User>("users")
            .replace_one(doc! {"id": &user.id}, user)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}

#[async_trait]
impl ChatStore for MongoStores {
    async fn insert(&self, chat: &Chat) -> Result<()> {
        let mut stored = chat.clone();
        stored.connection = self.encrypt_connection(&chat.connection)?;
        self.db
            .collection::<Chat>("chats")
            .insert_one(&stored)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn get(&self, id: &str) -> Result<Option<Chat>> {
        let found = self
            .db
            .collection::<Chat>("chats")
            .find_one(doc! {"id": id})
            .await
            .map_err(storage_err)?;
        match found {
            Some(mut chat) => {
                chat.connection = self.decrypt_connection(&chat.connection)?;
                Ok(Some(chat))
            }
            None => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        let cursor = self
            .db
            .collection::<Chat>("chats")
            .find(doc! {"user_id": user_id})
            .sort(doc! {"updated_at": -1})
            .await
            .map_err(storage_err)?;
        let chats: Vec<Chat> = cursor.try_collect().await.map_err(storage_err)?;
        chats
            .into_iter()
            .map(|mut chat| {
                chat.connection = self.decrypt_connection(&chat.connection)?;
                Ok(chat)
            })
            .collect()
    }

    async fn update(&self, chat: &Chat) -> Result<()> {
        let mut stored = chat.clone();
        stored.connection = self.encrypt_connection(&chat.connection)?;
        self.db
            .collection::<Chat>("chats")
            .replace_one(doc! {"id": &chat.id}, &stored)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.db
            .collection::<Chat>("chats")
            .delete_one(doc! {"id": id})
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}

#[async_trait]
impl MessageStore for MongoStores {
    async fn insert(&self, message: &Message) -> Result<()> {
        self.db
            .collection::<Message>("messages")
            .insert_one(message)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn get(&self, chat_id: &str, message_id: &str) -> Result<Option<Message>> {
        self.db
            .collection::<Message>("messages")
            .find_one(doc! {"chat_id": chat_id, "id": message_id})
            .await
            .map_err(storage_err)
    }

    async fn update(&self, message: &Message) -> Result<()> {
        self.db
            .collection::<Message>("messages")
            .replace_one(doc! {"id": &message.id}, message)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<Message>> {
        let cursor = self
            .db
            .collection::<Message>("messages")
            .find(doc! {"chat_id": chat_id})
            .sort(doc! {"created_at": -1})
            .limit(limit as i64)
            .await
            .map_err(storage_err)?;
        let mut messages: Vec<Message> = cursor.try_collect().await.map_err(storage_err)?;
        messages.reverse();
        Ok(messages)
    }

    async fn find_assistant_for(
        &self,
        chat_id: &str,
        user_message_id: &str,
    ) -> Result<Option<Message>> {
        self.db
            .collection::<Message>("messages")
            .find_one(doc! {
                "chat_id": chat_id,
                "user_message_id": user_message_id,
                "role": "assistant",
            })
            .sort(doc! {"created_at": -1})
            .await
            .map_err(storage_err)
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.db
            .collection::<Message>("messages")
            .delete_many(doc! {"chat_id": chat_id})
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}

#[async_trait]
impl LlmMessageStore for MongoStores {
    async fn append(&self, message: &LlmMessage) -> Result<()> {
        self.db
            .collection::<LlmMessage>("llm_messages")
            .insert_one(message)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn list_recent(&self, chat_id: &str, limit: usize) -> Result<Vec<LlmMessage>> {
        let cursor = self
            .db
            .collection::<LlmMessage>("llm_messages")
            .find(doc! {"chat_id": chat_id})
            .sort(doc! {"created_at": -1})
            .limit(limit as i64)
            .await
            .map_err(storage_err)?;
        let mut entries: Vec<LlmMessage> = cursor.try_collect().await.map_err(storage_err)?;
        entries.reverse();
        Ok(entries)
    }

    async fn replace_for_message(&self, message: &LlmMessage) -> Result<()> {
        let coll = self.db.collection::<LlmMessage>("llm_messages");
        coll.delete_many(doc! {"message_id": &message.message_id})
            .await
            .map_err(storage_err)?;
        coll.insert_one(message)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.db
            .collection::<LlmMessage>("llm_messages")
            .delete_many(doc! {"chat_id": chat_id})
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}

#[async_trait]
impl VisualizationStore for MongoStores {
    async fn insert(&self, viz: &Visualization) -> Result<()> {
        self.db
            .collection::<Visualization>("message_visualizations")
            .insert_one(viz)
            .await
            .map(|_| ())
            .map_err(storage_err)
    }

    async fn get(&self, id: &str) -> Result<Option<Visualization>> {
        self.db
            .collection::<Visualization>("message_visualizations")
            .find_one(doc! {"id": id})
            .await
            .map_err(storage_err)
    }

    async fn list_for_message(&self, message_id: &str) -> Result<Vec<Visualization>> {
        let cursor = self
            .db
            .collection::<Visualization>("message_visualizations")
            .find(doc! {"message_id": message_id})
            .await
            .map_err(storage_err)?;
        cursor.try_collect().await.map_err(storage_err)
    }

    async fn delete_for_chat(&self, chat_id: &str) -> Result<()> {
        self.db
            .collection::<Visualization>("message_visualizations")
            .delete_many(doc! {"chat_id": chat_id})
            .await
            .map(|_| ())
            .map_err(storage_err)
    }
}
