//! Server-push event union and SSE framing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{ActionButton, Query};

/// Payload of a terminal `ai-response` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponsePayload {
    pub message_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queries: Option<Vec<Query>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_buttons: Option<Vec<ActionButton>>,
    pub user_message_id: String,
    pub non_tech_mode: bool,
    pub action_at: DateTime<Utc>,
}

/// Payload of a `query-result` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultPayload {
    pub message_id: String,
    pub query_id: String,
    /// Execution path tag: "execute" or "rollback".
    pub tag: String,
    pub result: crate::db::QueryExecutionResult,
}

/// Everything the server pushes over a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum StreamEvent {
    DbConnected {
        chat_id: String,
    },
    DbDisconnected {
        chat_id: String,
    },
    /// Free-form progress line, tagged with the user turn it belongs
    /// to so edits replace in place.
    AiResponseStep {
        message: String,
        user_message_id: String,
    },
    /// Terminal success for a user turn.
    AiResponse(AiResponsePayload),
    /// Terminal failure for a user turn.
    AiResponseError {
        code: String,
        message: String,
        user_message_id: String,
    },
    /// Terminal cancellation for a user turn.
    ResponseCancelled {
        user_message_id: String,
    },
    /// Server-originated assistant message outside any turn.
    SystemMessage {
        message: String,
    },
    /// Result of an explicit query execution or rollback.
    QueryResult(QueryResultPayload),
}

impl StreamEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DbConnected { .. } => "db-connected",
            Self::DbDisconnected { .. } => "db-disconnected",
            Self::AiResponseStep { .. } => "ai-response-step",
            Self::AiResponse(_) => "ai-response",
            Self::AiResponseError { .. } => "ai-response-error",
            Self::ResponseCancelled { .. } => "response-cancelled",
            Self::SystemMessage { .. } => "system-message",
            Self::QueryResult(_) => "query-result",
        }
    }

    /// Returns true if this event terminates a user turn. At most one
    /// terminal event is delivered per turn.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AiResponse(_) | Self::AiResponseError { .. } | Self::ResponseCancelled { .. }
        )
    }

    /// Encodes the event as one SSE frame.
    pub fn to_sse_frame(&self) -> String {
        let data = match self {
            Self::AiResponse(payload) => serde_json::to_string(payload),
            Self::QueryResult(payload) => serde_json::to_string(payload),
            other => {
                // Untagged data body: the name already travels in the
                // `event:` field.
                match serde_json::to_value(other) {
                    Ok(serde_json::Value::Object(map)) => serde_json::to_string(
                        map.get("data").unwrap_or(&serde_json::Value::Null),
                    ),
                    Ok(v) => serde_json::to_string(&v),
                    Err(e) => Err(e),
                }
            }
        }
        .unwrap_or_else(|_| "null".to_string());

        format!("event: {}\ndata: {}\n\n", self.name(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        assert_eq!(
            StreamEvent::DbConnected {
                chat_id: "c1".into()
            }
            .name(),
            "db-connected"
        );
        assert_eq!(
            StreamEvent::ResponseCancelled {
                user_message_id: "m1".into()
            }
            .name(),
            "response-cancelled"
        );
    }

    #[test]
    fn test_terminal_classification() {
        assert!(StreamEvent::ResponseCancelled {
            user_message_id: "m1".into()
        }
        .is_terminal());
        assert!(StreamEvent::AiResponseError {
            code: "LLM_ERROR".into(),
            message: "boom".into(),
            user_message_id: "m1".into(),
        }
        .is_terminal());
        assert!(!StreamEvent::AiResponseStep {
            message: "analyzing".into(),
            user_message_id: "m1".into(),
        }
        .is_terminal());
        assert!(!StreamEvent::SystemMessage {
            message: "schema changed".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_sse_frame_shape() {
        let frame = StreamEvent::AiResponseStep {
            message: "NeoBase is analyzing your request...".into(),
            user_message_id: "m1".into(),
        }
        .to_sse_frame();

        assert!(frame.starts_with("event: ai-response-step\n"));
        assert!(frame.contains("data: {"));
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("analyzing"));
    }

    #[test]
    fn test_serde_tag_shape() {
        let event = StreamEvent::DbDisconnected {
            chat_id: "c9".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "db-disconnected");
        assert_eq!(json["data"]["chat_id"], "c9");
    }
}
