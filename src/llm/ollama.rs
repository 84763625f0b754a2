//! Ollama client (and other OpenAI-ish local completion servers).
//!
//! Local servers have no schema enforcement, so the strongest available
//! mechanism is the `format: "json"` token combined with the schema
//! spelled out in the system prompt. Validation still happens on our
//! side and failures surface as typed errors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::db::DatabaseType;
use crate::error::{NeoBaseError, Result};
use crate::llm::{
    cancellable, prompt, schema, visualization_user_message, AiResponse, LlmClient, LlmMessage,
    LlmProvider, ModelInfo, Recommendation, RecommendationSet, ResponseRequest,
    VisualizationRequest, VisualizationSpec, WireMessage,
};
use crate::models::MessageRole;

/// Default timeout; local models can be slow on first load.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Default base URL for a local Ollama.
const OLLAMA_BASE_URL: &str = "http://localhost:11434";

/// Default model when the environment does not pick one.
const DEFAULT_MODEL: &str = "llama3.1";

/// Ollama client configuration.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OllamaConfig {
    /// Creates a config pointing at the default local server.
    pub fn new() -> Self {
        Self {
            base_url: OLLAMA_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Overrides the base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Ollama LLM client.
pub struct OllamaClient {
    config: OllamaConfig,
    model: RwLock<String>,
    client: Client,
}

impl OllamaClient {
    /// Creates a client from the given configuration.
    pub fn new(config: OllamaConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NeoBaseError::llm(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            model: RwLock::new(config.model.clone()),
            config,
            client,
        })
    }

    fn model_for(&self, model_override: Option<&str>) -> String {
        match model_override {
            Some(model) => model.to_string(),
            None => self.model.read().expect("model lock").clone(),
        }
    }

    /// Runs one JSON-format completion and returns the raw document
    /// text.
    async fn complete(
        &self,
        ctx: &CancellationToken,
        model: &str,
        system: &str,
        messages: &[WireMessage],
        expected_schema: &serde_json::Value,
    ) -> Result<String> {
        // Local models need the schema in-band.
        let system = format!(
            "{system}\nThe JSON object must match this JSON Schema exactly:\n{}",
            serde_json::to_string_pretty(expected_schema).unwrap_or_default()
        );

        let mut wire = vec![OllamaMessage {
            role: "system".to_string(),
            content: system,
        }];
        wire.extend(messages.iter().map(|m| OllamaMessage {
            role: match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            }
            .to_string(),
            content: m.content.clone(),
        }));

        let request = OllamaRequest {
            model: model.to_string(),
            messages: wire,
            stream: false,
            format: "json".to_string(),
        };

        let url = format!("{}/api/chat", self.config.base_url);
        let response = cancellable(ctx, async {
            self.client.post(&url).json(&request).send().await.map_err(|e| {
                if e.is_timeout() {
                    NeoBaseError::llm("Request timed out. The model may still be loading.")
                } else if e.is_connect() {
                    NeoBaseError::llm(format!(
                        "Failed to connect to Ollama at {}. Is it running?",
                        self.config.base_url
                    ))
                } else {
                    NeoBaseError::llm(format!("Request failed: {e}"))
                }
            })
        })
        .await?;

        let status = response.status();
        let body = cancellable(ctx, async {
            response
                .text()
                .await
                .map_err(|e| NeoBaseError::llm(format!("Failed to read response: {e}")))
        })
        .await?;

        if !status.is_success() {
            return Err(NeoBaseError::llm(format!("Ollama error ({status}): {body}")));
        }

        let parsed: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| NeoBaseError::llm_invalid_response(format!("unexpected body: {e}")))?;

        if parsed.message.content.is_empty() {
            return Err(NeoBaseError::llm_invalid_response("empty completion"));
        }
        Ok(parsed.message.content)
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Ollama
    }

    fn get_model_info(&self) -> ModelInfo {
        let model = self.model.read().expect("model lock").clone();
        ModelInfo {
            provider: "ollama".to_string(),
            display_name: model.clone(),
            id: model,
            context_window: 32_000,
        }
    }

    fn set_model(&self, model_id: &str) {
        *self.model.write().expect("model lock") = model_id.to_string();
    }

    async fn generate_response(
        &self,
        ctx: &CancellationToken,
        request: &ResponseRequest,
    ) -> Result<AiResponse> {
        let system = prompt::build_system_prompt(
            self.provider(),
            request.db_type,
            request.non_tech_mode,
            request.schema_context.as_deref(),
        );
        let history = prompt::render_history(&request.messages, request.non_tech_mode);
        let model = self.model_for(request.model_override.as_deref());

        let raw = self
            .complete(
                ctx,
                &model,
                &system,
                &history,
                &schema::response_schema(request.db_type),
            )
            .await?;
        AiResponse::parse(&raw)
    }

    async fn generate_recommendations(
        &self,
        ctx: &CancellationToken,
        messages: &[LlmMessage],
        db_type: DatabaseType,
    ) -> Result<Vec<Recommendation>> {
        let system = prompt::build_recommendations_prompt(db_type);
        let history = prompt::render_history(messages, false);
        let model = self.model_for(None);

        let raw = self
            .complete(
                ctx,
                &model,
                &system,
                &history,
                &schema::recommendations_schema(),
            )
            .await?;
        RecommendationSet::parse(&raw)
    }

    async fn generate_visualization(
        &self,
        ctx: &CancellationToken,
        request: &VisualizationRequest,
    ) -> Result<VisualizationSpec> {
        let system = prompt::build_visualization_prompt(request.db_type);
        let user = WireMessage {
            role: MessageRole::User,
            content: visualization_user_message(request),
        };
        let model = self.model_for(request.model_override.as_deref());

        let raw = self
            .complete(
                ctx,
                &model,
                &system,
                std::slice::from_ref(&user),
                &schema::visualization_schema(),
            )
            .await?;
        VisualizationSpec::parse(&raw)
    }
}

// Ollama API types

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    format: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OllamaConfig::new();
        assert_eq!(config.base_url, OLLAMA_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_request_uses_format_token() {
        let request = OllamaRequest {
            model: "llama3.1".into(),
            messages: vec![],
            stream: false,
            format: "json".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["format"], "json");
        assert_eq!(json["stream"], false);
    }

    #[test]
    fn test_model_override_does_not_change_default() {
        let client = OllamaClient::new(OllamaConfig::new()).unwrap();
        assert_eq!(client.model_for(Some("qwen2.5-coder")), "qwen2.5-coder");
        assert_eq!(client.get_model_info().id, DEFAULT_MODEL);
    }
}
