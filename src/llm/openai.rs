//! OpenAI client.
//!
//! Structured output is enforced with the native `json_schema` response
//! format in strict mode, so the completion body is the document
//! itself.

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
const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Default model when the environment does not pick one.
const DEFAULT_MODEL: &str = "gpt-4o";

/// Maximum tokens to generate.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// OpenAI client configuration.
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl OpenAiConfig {
    /// Creates a config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Overrides the base URL (proxies, Azure-compatible gateways).
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

/// OpenAI LLM client.
pub struct OpenAiClient {
    config: OpenAiConfig,
    model: RwLock<String>,
    client: Client,
}

impl OpenAiClient {
    /// Creates a client from the given configuration.
    pub fn new(config: OpenAiConfig) -> Result<Self> {
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

    /// Runs one schema-constrained completion and returns the raw JSON
    /// document text.
    async fn complete(
        &self,
        ctx: &CancellationToken,
        model: &str,
        system: &str,
        messages: &[WireMessage],
        schema_name: &str,
        response_schema: serde_json::Value,
    ) -> Result<String> {
        let mut wire = vec![OpenAiMessage {
            role: "system".to_string(),
            content: system.to_string(),
        }];
        wire.extend(messages.iter().map(|m| OpenAiMessage {
            role: match m.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::System => "system",
            }
            .to_string(),
            content: m.content.clone(),
        }));

        let request = OpenAiRequest {
            model: model.to_string(),
            messages: wire,
            max_tokens: self.config.max_tokens,
            response_format: ResponseFormat {
                format_type: "json_schema".to_string(),
                json_schema: JsonSchemaFormat {
                    name: schema_name.to_string(),
                    strict: true,
                    schema: response_schema,
                },
            },
        };

        let url = format!("{}/chat/completions", self.config.base_url);
        let response = cancellable(ctx, async {
            self.client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        NeoBaseError::llm("Request timed out. Try again.")
                    } else if e.is_connect() {
                        NeoBaseError::llm("Failed to connect to OpenAI. Check your network.")
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

        let parsed: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| NeoBaseError::llm_invalid_response(format!("unexpected body: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| NeoBaseError::llm_invalid_response("no completion choices returned"))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::OpenAi
    }

    fn get_model_info(&self) -> ModelInfo {
        let model = self.model.read().expect("model lock").clone();
        ModelInfo {
            provider: "openai".to_string(),
            display_name: model.clone(),
            id: model,
            context_window: 128_000,
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
                "neobase_response",
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
                "neobase_recommendations",
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
                "neobase_visualization",
                schema::visualization_schema(),
            )
            .await?;
        VisualizationSpec::parse(&raw)
    }
}

/// Parses an API error response into a user-facing error.
fn parse_error(status: reqwest::StatusCode, body: &str) -> NeoBaseError {
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return NeoBaseError::llm("Authentication failed. Check your OpenAI API key.");
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return NeoBaseError::llm("Rate limited by OpenAI. Please wait and try again.");
    }

    if let Ok(error_response) = serde_json::from_str::<OpenAiErrorResponse>(body) {
        return NeoBaseError::llm(format!("OpenAI API error: {}", error_response.error.message));
    }

    NeoBaseError::llm(format!("OpenAI API error ({status}): {body}"))
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: String,
    strict: bool,
    schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OpenAiConfig::new("sk-test");
        assert_eq!(config.base_url, OPENAI_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_model_override_does_not_change_default() {
        let client = OpenAiClient::new(OpenAiConfig::new("sk-test")).unwrap();
        assert_eq!(client.model_for(Some("gpt-4o-mini")), "gpt-4o-mini");
        assert_eq!(client.get_model_info().id, DEFAULT_MODEL);
    }

    #[test]
    fn test_set_model_swaps_default() {
        let client = OpenAiClient::new(OpenAiConfig::new("sk-test")).unwrap();
        client.set_model("gpt-4.1");
        assert_eq!(client.get_model_info().id, "gpt-4.1");
        assert_eq!(client.model_for(None), "gpt-4.1");
    }

    #[test]
    fn test_parse_error_unauthorized() {
        let error = parse_error(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(error.to_string().contains("Authentication failed"));
    }

    #[test]
    fn test_parse_error_with_message() {
        let body = r#"{"error":{"message":"Invalid schema"}}"#;
        let error = parse_error(reqwest::StatusCode::BAD_REQUEST, body);
        assert!(error.to_string().contains("Invalid schema"));
    }

    #[test]
    fn test_request_serializes_response_format() {
        let request = OpenAiRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            max_tokens: 64,
            response_format: ResponseFormat {
                format_type: "json_schema".into(),
                json_schema: JsonSchemaFormat {
                    name: "neobase_response".into(),
                    strict: true,
                    schema: serde_json::json!({"type": "object"}),
                },
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["strict"], true);
    }
}
