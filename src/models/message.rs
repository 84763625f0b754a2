//! Chat messages and the queries they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::QueryError;

/// Role of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Execution lifecycle of a query inside an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    #[default]
    Pending,
    Executed,
    Failed,
    RolledBack,
}

/// A database query produced by the LLM, embedded in an assistant
/// message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    /// Query text, passed to the driver verbatim.
    pub query: String,
    /// Dialect-specific kind reported by the LLM ("SELECT", "UPDATE",
    /// a Mongo operation name, ...). Advisory only; the chat service
    /// classifies reads and writes itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    /// Tables/collections the query touches, per the LLM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tables: Option<String>,
    /// Inverse query, produced alongside every write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_query: Option<String>,
    /// Sampled example rows included with the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example_result: Option<serde_json::Value>,
    #[serde(default)]
    pub status: QueryStatus,
    /// Milliseconds taken by the last execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    /// Structured error from the last failed execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
    /// Chart configuration attached to this query, if generated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visualization_id: Option<String>,
}

impl Query {
    /// Creates a pending query with a fresh id.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            query_type: None,
            tables: None,
            rollback_query: None,
            example_result: None,
            status: QueryStatus::Pending,
            execution_time_ms: None,
            error: None,
            visualization_id: None,
        }
    }

    /// Returns true if a rollback query is available and the forward
    /// query has executed.
    pub fn can_rollback(&self) -> bool {
        self.rollback_query.is_some() && self.status == QueryStatus::Executed
    }
}

/// A clickable follow-up the client renders under an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionButton {
    pub id: String,
    pub label: String,
    /// Client-interpreted action keyword ("refresh_schema", ...).
    pub action: String,
    #[serde(default)]
    pub is_primary: bool,
}

/// A persisted chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Present on assistant messages that carry executable queries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<Query>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_buttons: Option<Vec<ActionButton>>,
    /// For assistant messages: the user message this responds to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_message_id: Option<String>,
    #[serde(default)]
    pub is_edited: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    /// Creates a user message.
    pub fn user(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(chat_id, MessageRole::User, content)
    }

    /// Creates an assistant message paired to the user message it
    /// answers.
    pub fn assistant(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        user_message_id: impl Into<String>,
    ) -> Self {
        let mut msg = Self::new(chat_id, MessageRole::Assistant, content);
        msg.user_message_id = Some(user_message_id.into());
        msg
    }

    /// Creates a server-originated system message.
    pub fn system(chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(chat_id, MessageRole::System, content)
    }

    fn new(chat_id: impl Into<String>, role: MessageRole, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            role,
            content: content.into(),
            queries: None,
            action_buttons: None,
            user_message_id: None,
            is_edited: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Clears the generated parts of an assistant message before it is
    /// regenerated in place. Id and pairing are preserved.
    pub fn clear_for_regeneration(&mut self) {
        self.content.clear();
        self.queries = None;
        self.action_buttons = None;
        self.updated_at = Utc::now();
    }

    /// Finds the query with the given id.
    pub fn query(&self, query_id: &str) -> Option<&Query> {
        self.queries.as_ref()?.iter().find(|q| q.id == query_id)
    }

    /// Finds the query with the given id, mutably.
    pub fn query_mut(&mut self, query_id: &str) -> Option<&mut Query> {
        self.queries.as_mut()?.iter_mut().find(|q| q.id == query_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_message_carries_user_id() {
        let user = Message::user("c1", "show me users");
        let assistant = Message::assistant("c1", "Here you go", user.id.clone());
        assert_eq!(assistant.user_message_id.as_deref(), Some(user.id.as_str()));
        assert_eq!(assistant.role, MessageRole::Assistant);
    }

    #[test]
    fn test_clear_for_regeneration_keeps_identity() {
        let user = Message::user("c1", "top 10 orders");
        let mut assistant = Message::assistant("c1", "SELECT ...", user.id.clone());
        assistant.queries = Some(vec![Query::new("SELECT * FROM orders LIMIT 10")]);
        let id = assistant.id.clone();

        assistant.clear_for_regeneration();

        assert_eq!(assistant.id, id);
        assert_eq!(assistant.user_message_id.as_deref(), Some(user.id.as_str()));
        assert!(assistant.content.is_empty());
        assert!(assistant.queries.is_none());
        assert!(assistant.action_buttons.is_none());
    }

    #[test]
    fn test_can_rollback_requires_execution() {
        let mut q = Query::new("UPDATE users SET name = upper(name)");
        q.rollback_query = Some("UPDATE users SET name = lower(name)".into());
        assert!(!q.can_rollback());
        q.status = QueryStatus::Executed;
        assert!(q.can_rollback());
        q.status = QueryStatus::RolledBack;
        assert!(!q.can_rollback());
    }

    #[test]
    fn test_query_lookup() {
        let mut msg = Message::user("c1", "x");
        let q = Query::new("SELECT 1");
        let qid = q.id.clone();
        msg.queries = Some(vec![q]);
        assert!(msg.query(&qid).is_some());
        assert!(msg.query("missing").is_none());
        msg.query_mut(&qid).unwrap().status = QueryStatus::Executed;
        assert_eq!(msg.query(&qid).unwrap().status, QueryStatus::Executed);
    }
}
