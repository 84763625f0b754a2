//! Types for LLM conversations and structured responses.
//!
//! Every completion comes back as one JSON document; these are the
//! typed forms it must deserialize into. Validation failures surface as
//! `LlmInvalidResponse`, never as a silently retried call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{NeoBaseError, Result};
use crate::models::MessageRole;

/// One entry of the conversation history kept for model context.
///
/// The non-tech flag records the mode at generation time so history
/// items can be annotated when the current request's mode differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub id: String,
    pub chat_id: String,
    /// The chat message this history entry mirrors.
    pub message_id: String,
    pub role: MessageRole,
    /// Content map as sent to the provider (text plus optional query
    /// payloads).
    pub content: serde_json::Value,
    #[serde(default)]
    pub non_tech_mode: bool,
    pub created_at: DateTime<Utc>,
}

impl LlmMessage {
    /// Creates a history entry mirroring a chat message.
    pub fn new(
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        role: MessageRole,
        content: serde_json::Value,
        non_tech_mode: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            role,
            content,
            non_tech_mode,
            created_at: Utc::now(),
        }
    }

    /// Returns the plain-text rendering of the content map.
    pub fn content_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Object(map) => map
                .get("assistant_message")
                .or_else(|| map.get("user_message"))
                .or_else(|| map.get("content"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| self.content.to_string()),
            other => other.to_string(),
        }
    }
}

/// A query produced inside a structured response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    /// Query text in the connection's dialect.
    pub query: String,
    /// Dialect-specific kind ("SELECT", "updateMany", ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    /// Comma-separated tables the query touches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<String>,
    /// One-line explanation shown to the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Inverse query; required for every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_query: Option<String>,
}

/// An action button suggested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionButtonSpec {
    pub label: String,
    pub action: String,
}

/// The structured document every chat completion must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiResponse {
    /// Conversational reply shown in the chat.
    pub assistant_message: String,
    #[serde(default)]
    pub queries: Vec<QuerySpec>,
    #[serde(default)]
    pub action_buttons: Vec<ActionButtonSpec>,
}

impl AiResponse {
    /// Parses and validates a provider's raw JSON output.
    pub fn parse(raw: &str) -> Result<Self> {
        let response: Self = serde_json::from_str(raw.trim()).map_err(|e| {
            NeoBaseError::llm_invalid_response(format!(
                "response is not valid JSON for the expected schema: {e}"
            ))
        })?;
        if response.assistant_message.trim().is_empty() {
            return Err(NeoBaseError::llm_invalid_response(
                "response is missing 'assistant_message'",
            ));
        }
        Ok(response)
    }
}

/// One follow-up question recommendation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Wrapper document for the recommendations call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationSet {
    pub recommendations: Vec<Recommendation>,
}

impl RecommendationSet {
    /// Parses and validates a provider's raw JSON output.
    pub fn parse(raw: &str) -> Result<Vec<Recommendation>> {
        let set: Self = serde_json::from_str(raw.trim()).map_err(|e| {
            NeoBaseError::llm_invalid_response(format!(
                "recommendations are not valid JSON for the expected schema: {e}"
            ))
        })?;
        Ok(set.recommendations)
    }
}

/// The structured chart configuration a visualization call must match.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VisualizationSpec {
    /// One of: bar, line, area, pie, scatter.
    pub chart_type: String,
    pub x_axis: AxisSpec,
    pub y_axis: Vec<AxisSpec>,
    #[serde(default)]
    pub colors: Vec<String>,
    /// Query optimized for chart data (aggregated, bounded).
    pub fetch_query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projected_row_count: Option<u64>,
}

/// One axis/series binding inside a visualization spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AxisSpec {
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl VisualizationSpec {
    /// Parses and validates a provider's raw JSON output.
    pub fn parse(raw: &str) -> Result<Self> {
        let spec: Self = serde_json::from_str(raw.trim()).map_err(|e| {
            NeoBaseError::llm_invalid_response(format!(
                "visualization is not valid JSON for the expected schema: {e}"
            ))
        })?;
        if spec.fetch_query.trim().is_empty() {
            return Err(NeoBaseError::llm_invalid_response(
                "visualization is missing 'fetch_query'",
            ));
        }
        Ok(spec)
    }
}

/// Static description of a model, for the available-models listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    /// Context window in tokens, as documented by the provider.
    pub context_window: u32,
}

/// Inputs for a chat completion call.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub messages: Vec<LlmMessage>,
    pub db_type: crate::db::DatabaseType,
    pub non_tech_mode: bool,
    /// Rendered schema context, already filtered and sampled.
    pub schema_context: Option<String>,
    /// Per-message model override; the registered default is unchanged.
    pub model_override: Option<String>,
}

/// Inputs for a visualization call.
#[derive(Debug, Clone)]
pub struct VisualizationRequest {
    pub db_type: crate::db::DatabaseType,
    pub query: String,
    /// Column names of the result the chart will draw from.
    pub columns: Vec<String>,
    /// Bounded sample rows, JSON-rendered.
    pub sample_rows: serde_json::Value,
    pub model_override: Option<String>,
}
