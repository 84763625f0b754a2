//! LLM integration: provider clients with enforced structured output.
//!
//! Every provider call returns a single JSON document matching a
//! per-(provider, database-type) schema, enforced through the
//! provider's strongest native mechanism. Parsing failures are typed
//! errors; nothing is regex-scraped out of prose.

pub mod claude;
pub mod gemini;
pub mod manager;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod prompt;
pub mod schema;
pub mod types;

pub use claude::ClaudeClient;
pub use gemini::GeminiClient;
pub use manager::{LlmManager, ModelCatalogEntry};
pub use mock::MockLlmClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use prompt::{
    build_recommendations_prompt, build_system_prompt, build_visualization_prompt,
    render_history, WireMessage,
};
pub use types::{
    ActionButtonSpec, AiResponse, AxisSpec, LlmMessage, ModelInfo, QuerySpec, Recommendation,
    RecommendationSet, ResponseRequest, VisualizationRequest, VisualizationSpec,
};

use async_trait::async_trait;
use std::future::Future;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;

use crate::db::DatabaseType;
use crate::error::{NeoBaseError, Result};

/// LLM provider keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmProvider {
    OpenAi,
    Gemini,
    Claude,
    /// Ollama or any other OpenAI-ish local completion server.
    Ollama,
    /// Mock client for tests (no API key required).
    Mock,
}

impl LlmProvider {
    /// Returns the provider key as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
            Self::Ollama => "ollama",
            Self::Mock => "mock",
        }
    }
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "claude" | "anthropic" => Ok(Self::Claude),
            "ollama" => Ok(Self::Ollama),
            "mock" => Ok(Self::Mock),
            _ => Err(format!("Unknown LLM provider: {s}")),
        }
    }
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trait for provider clients.
///
/// Implementations must be thread-safe; internal mutable state (the
/// registered default model) sits behind a lock.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// The provider behind this client.
    fn provider(&self) -> LlmProvider;

    /// Info for the currently registered default model.
    fn get_model_info(&self) -> ModelInfo;

    /// Swaps the registered default model.
    fn set_model(&self, model_id: &str);

    /// Generates the structured chat response for a user turn.
    async fn generate_response(
        &self,
        ctx: &CancellationToken,
        request: &ResponseRequest,
    ) -> Result<AiResponse>;

    /// Suggests follow-up questions from the conversation so far.
    async fn generate_recommendations(
        &self,
        ctx: &CancellationToken,
        messages: &[LlmMessage],
        db_type: DatabaseType,
    ) -> Result<Vec<Recommendation>>;

    /// Designs a chart configuration for a query result.
    async fn generate_visualization(
        &self,
        ctx: &CancellationToken,
        request: &VisualizationRequest,
    ) -> Result<VisualizationSpec>;
}

/// Races a provider call against the request's cancellation signal.
pub(crate) async fn cancellable<F, T>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = ctx.cancelled() => Err(NeoBaseError::Cancelled),
        res = fut => res,
    }
}

/// Renders the user-facing payload for a visualization call.
pub(crate) fn visualization_user_message(request: &VisualizationRequest) -> String {
    format!(
        "Query:\n{}\n\nResult columns: {}\n\nSample rows:\n{}",
        request.query,
        request.columns.join(", "),
        serde_json::to_string_pretty(&request.sample_rows).unwrap_or_default()
    )
}
