//! Gemini (Google) client.
//!
//! Structured output is enforced with `responseMimeType:
//! application/json` plus a `responseSchema`. Gemini's schema dialect
//! is an OpenAPI subset with uppercase type names, so the shared JSON
//! Schemas are converted before each call.

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
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model when the environment does not pick one.
const DEFAULT_MODEL: &str = "gemini-2.0-flash";

/// Gemini client configuration.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl GeminiConfig {
    /// Creates a config with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_BASE_URL.to_string(),
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

/// Gemini LLM client.
pub struct GeminiClient {
    config: GeminiConfig,
    model: RwLock<String>,
    client: Client,
}

impl GeminiClient {
    /// Creates a client from the given configuration.
    pub fn new(config: GeminiConfig) -> Result<Self> {
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

    /// Runs one schema-constrained generation and returns the raw JSON
    /// document text.
    async fn complete(
        &self,
        ctx: &CancellationToken,
        model: &str,
        system: &str,
        messages: &[WireMessage],
        response_schema: serde_json::Value,
    ) -> Result<String> {
        let mut contents: Vec<GeminiContent> = messages
            .iter()
            .map(|m| GeminiContent {
                role: match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                }
                .to_string(),
                parts: vec![GeminiPart {
                    text: m.content.clone(),
                }],
            })
            .collect();
        if contents.is_empty() {
            contents.push(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: "Respond with the structured document.".to_string(),
                }],
            });
        }

        let request = GeminiRequest {
            system_instruction: GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: system.to_string(),
                }],
            },
            contents,
            generation_config: GenerationConfig {
                response_mime_type: "application/json".to_string(),
                response_schema: to_gemini_schema(&response_schema),
            },
        };

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url, model, self.config.api_key
        );
        let response = cancellable(ctx, async {
            self.client.post(&url).json(&request).send().await.map_err(|e| {
                if e.is_timeout() {
                    NeoBaseError::llm("Request timed out. Try again.")
                } else if e.is_connect() {
                    NeoBaseError::llm("Failed to connect to the Gemini API. Check your network.")
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

        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| NeoBaseError::llm_invalid_response(format!("unexpected body: {e}")))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| NeoBaseError::llm_invalid_response("no candidates returned"))
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Gemini
    }

    fn get_model_info(&self) -> ModelInfo {
        let model = self.model.read().expect("model lock").clone();
        ModelInfo {
            provider: "gemini".to_string(),
            display_name: model.clone(),
            id: model,
            context_window: 1_000_000,
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
            .complete(ctx, &model, &system, &history, schema::response_schema(request.db_type))
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
            .complete(ctx, &model, &system, &history, schema::recommendations_schema())
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
                schema::visualization_schema(),
            )
            .await?;
        VisualizationSpec::parse(&raw)
    }
}

/// Converts a JSON Schema document to Gemini's OpenAPI-subset dialect.
///
/// Handles the constructs the shared schemas use: object/array nesting,
/// required lists, enums, and `["T", "null"]` nullability. Unsupported
/// keywords are dropped.
fn to_gemini_schema(schema: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    let Value::Object(obj) = schema else {
        return schema.clone();
    };

    let mut out = serde_json::Map::new();

    match obj.get("type") {
        Some(Value::String(t)) => {
            out.insert("type".into(), Value::String(t.to_uppercase()));
        }
        Some(Value::Array(types)) => {
            // ["string", "null"] becomes a nullable STRING.
            let non_null = types
                .iter()
                .filter_map(|t| t.as_str())
                .find(|t| *t != "null")
                .unwrap_or("string");
            out.insert("type".into(), Value::String(non_null.to_uppercase()));
            if types.iter().any(|t| t.as_str() == Some("null")) {
                out.insert("nullable".into(), Value::Bool(true));
            }
        }
        _ => {}
    }

    if let Some(Value::String(desc)) = obj.get("description") {
        out.insert("description".into(), Value::String(desc.clone()));
    }
    if let Some(Value::Array(variants)) = obj.get("enum") {
        out.insert("enum".into(), Value::Array(variants.clone()));
    }
    if let Some(Value::Array(required)) = obj.get("required") {
        out.insert("required".into(), Value::Array(required.clone()));
    }
    if let Some(Value::Object(props)) = obj.get("properties") {
        let converted: serde_json::Map<String, Value> = props
            .iter()
            .map(|(k, v)| (k.clone(), to_gemini_schema(v)))
            .collect();
        out.insert("properties".into(), Value::Object(converted));
    }
    if let Some(items) = obj.get("items") {
        out.insert("items".into(), to_gemini_schema(items));
    }

    Value::Object(out)
}

/// Parses an API error response into a user-facing error.
fn parse_error(status: reqwest::StatusCode, body: &str) -> NeoBaseError {
    if status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::UNAUTHORIZED {
        return NeoBaseError::llm("Authentication failed. Check your Gemini API key.");
    }
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return NeoBaseError::llm("Rate limited by Gemini. Please wait and try again.");
    }

    if let Ok(error_response) = serde_json::from_str::<GeminiErrorResponse>(body) {
        return NeoBaseError::llm(format!("Gemini API error: {}", error_response.error.message));
    }

    NeoBaseError::llm(format!("Gemini API error ({status}): {body}"))
}

// Gemini API types

#[derive(Debug, Serialize)]
struct GeminiRequest {
    #[serde(rename = "systemInstruction")]
    system_instruction: GeminiContent,
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType")]
    response_mime_type: String,
    #[serde(rename = "responseSchema")]
    response_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorResponse {
    error: GeminiError,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = GeminiConfig::new("AIza-test");
        assert_eq!(config.base_url, GEMINI_BASE_URL);
        assert_eq!(config.model, DEFAULT_MODEL);
    }

    #[test]
    fn test_schema_conversion_uppercases_types() {
        let converted = to_gemini_schema(&serde_json::json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "description": "a name"},
                "count": {"type": "integer"}
            },
            "required": ["name"],
            "additionalProperties": false
        }));
        assert_eq!(converted["type"], "OBJECT");
        assert_eq!(converted["properties"]["name"]["type"], "STRING");
        assert_eq!(converted["properties"]["count"]["type"], "INTEGER");
        assert_eq!(converted["required"][0], "name");
        assert!(converted.get("additionalProperties").is_none());
    }

    #[test]
    fn test_schema_conversion_nullable_union() {
        let converted = to_gemini_schema(&serde_json::json!({
            "type": ["string", "null"]
        }));
        assert_eq!(converted["type"], "STRING");
        assert_eq!(converted["nullable"], true);
    }

    #[test]
    fn test_schema_conversion_nested_arrays() {
        let converted = to_gemini_schema(&schema::response_schema(DatabaseType::Postgres));
        assert_eq!(converted["properties"]["queries"]["type"], "ARRAY");
        assert_eq!(
            converted["properties"]["queries"]["items"]["properties"]["query"]["type"],
            "STRING"
        );
    }

    #[test]
    fn test_model_override_does_not_change_default() {
        let client = GeminiClient::new(GeminiConfig::new("AIza-test")).unwrap();
        assert_eq!(
            client.model_for(Some("gemini-2.0-pro")),
            "gemini-2.0-pro"
        );
        assert_eq!(client.get_model_info().id, DEFAULT_MODEL);
    }
}
