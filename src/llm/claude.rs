//! Claude (Anthropic) client.
//!
//! Structured output is enforced by forcing a tool call whose input
//! schema is the response schema; the tool input block then *is* the
//! document.

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

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default API base URL.
const CLAUDE_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default model when the environment does not pick one.
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

/// Maximum tokens to generate.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Claude client configuration.
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl ClaudeConfig {
    /// Creates a config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: CLAUDE_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_tokens: DEFAULT_MAX_TOKENS,
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

/// Claude LLM client.
pub struct ClaudeClient {
    config: ClaudeConfig,
    model: RwLock<String>,
    client: Client,
}

impl ClaudeClient {
    /// Creates a client from the given configuration.
    pub fn new(config: ClaudeConfig) -> Result<Self> {
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

    /// Runs one forced-tool completion and returns the tool input as a
    /// JSON string.
    async fn complete(
        &self,
        ctx: &CancellationToken,
        model: &str,
        system: &str,
        messages: &[WireMessage],
        tool_name: &str,
        input_schema: serde_json::Value,
    ) -> Result<String> {
        // Claude takes the system prompt as a separate parameter and
        // requires the turn list to start with a user message.
        let mut wire: Vec<ClaudeMessage> = messages
            .iter()
            .map(|m| ClaudeMessage {
                role: match m.role {
                    MessageRole::Assistant => "assistant",
                    _ => "user",
                }
                .to_string(),
                content: m.content.clone(),
            })
            .collect();
        if wire.is_empty() {
            wire.push(ClaudeMessage {
                role: "user".to_string(),
                content: "Respond using the tool.".to_string(),
            });
        }

        let request = ClaudeRequest {
            model: model.to_string(),
            max_tokens: self.config.max_tokens,
            system: Some(system.to_string()),
            messages: wire,
            tools: vec![ClaudeTool {
                name: tool_name.to_string(),
                description: "Emit the structured response document.".to_string(),
                input_schema,
            }],
            tool_choice: ToolChoice {
                choice_type: "tool".to_string(),
                name: tool_name.to_string(),
            },
        };

        let url = format!("{}/v1/messages", self.config.base_url);
        let response = cancellable(ctx, async {
            self.client
                .post(&url)
                .header("x-api-key", &self.config.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NeoBaseError::llm("Request timed out. Try again.")
                    } else if e.is_connect() {
                        NeoBaseError::llm("Failed to connect to the Anthropic API. Check your network.")
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
            return Err(parse_error(status, &body));
        }

        let parsed: ClaudeResponse = serde_json::from_str(&body)
            .map_err(|e| NeoBaseError::llm_invalid_response(format!("unexpected body: {e}")))?;

        let input = parsed
            .content
            .into_iter()
            .find(|block| block.block_type == "tool_use")
            .and_then(|block| block.input)
            .ok_or_else(|| {
                NeoBaseError::llm_invalid_response("no tool_use block in the response")
            })?;

        serde_json::to_string(&input)
            .map_err(|e| NeoBaseError::llm_invalid_response(format!("tool input: {e}")))
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Claude
    }

    fn get_model_info(&self) -> ModelInfo {
        let model = self.model.read().expect("model lock").clone();
        ModelInfo {
            provider: "claude".to_string(),
            display_name: model.clone(),
            id: model,
            context_window: 200_000,
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
                "emit_response",
                schema::response_schema(request.db_type),
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
                "emit_recommendations",
                schema::recommendations_schema(),
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
                "emit_visualization",
                schema::visualization_schema(),
            )
            .await?;
        VisualizationSpec::parse(&raw)
    }
}

/// Parses an API error response into a user-facing error.
fn parse_error(status: reqwest::StatusCode, body: &str) -> NeoBaseError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return NeoBaseError::llm("Authentication failed. Check your Anthropic API key.");
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return NeoBaseError::llm("Rate limited by Anthropic. Please wait and try again.");
    }

    if let Ok(error_response) = serde_json::from_str::<ClaudeErrorResponse>(body) {
        return NeoBaseError::llm(format!(
            "Anthropic API error: {}",
            error_response.error.message
        ));
    }

    NeoBaseError::llm(format!("Anthropic API error ({status}): {body}"))
}

// Anthropic API types

#[derive(Debug, Serialize)]
struct ClaudeRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ClaudeMessage>,
    tools: Vec<ClaudeTool>,
    tool_choice: ToolChoice,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClaudeMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ClaudeTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ToolChoice {
    #[serde(rename = "type")]
    choice_type: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    input: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ClaudeErrorResponse {
    error: ClaudeError,
}

#[derive(Debug, Deserialize)]
struct ClaudeError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClaudeConfig::new("sk-ant-test");
        assert_eq!(config.base_url, CLAUDE_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_model_override_does_not_change_default() {
        let client = ClaudeClient::new(ClaudeConfig::new("sk-ant-test")).unwrap();
        assert_eq!(
            client.model_for(Some("claude-3-5-haiku-latest")),
            "claude-3-5-haiku-latest"
        );
        assert_eq!(client.get_model_info().id, DEFAULT_MODEL);
    }

    #[test]
    fn test_request_forces_tool_choice() {
        let request = ClaudeRequest {
            model: DEFAULT_MODEL.into(),
            max_tokens: 64,
            system: None,
            messages: vec![],
            tools: vec![ClaudeTool {
                name: "emit_response".into(),
                description: "d".into(),
                input_schema: serde_json::json!({"type": "object"}),
            }],
            tool_choice: ToolChoice {
                choice_type: "tool".into(),
                name: "emit_response".into(),
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tool_choice"]["type"], "tool");
        assert_eq!(json["tool_choice"]["name"], "emit_response");
    }

    #[test]
    fn test_tool_use_extraction_shape() {
        let body = r#"{"content":[
            {"type":"text","text":"thinking"},
            {"type":"tool_use","id":"t1","name":"emit_response",
             "input":{"assistant_message":"Done.","queries":[]}}
        ]}"#;
        let parsed: ClaudeResponse = serde_json::from_str(body).unwrap();
        let input = parsed
            .content
            .into_iter()
            .find(|b| b.block_type == "tool_use")
            .and_then(|b| b.input)
            .unwrap();
        assert_eq!(input["assistant_message"], "Done.");
    }

    #[test]
    fn test_parse_error_rate_limited() {
        let error = parse_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(error.to_string().contains("Rate limited"));
    }
}
