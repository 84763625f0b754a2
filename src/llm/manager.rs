//! LLM manager: the provider-client registry.
//!
//! Built once at startup from the environment and read-only afterward;
//! per-client mutable state (the registered default model) lives inside
//! each client behind its own lock. Model resolution maps a model id to
//! the provider client that serves it, so a chat's preferred model (or
//! a per-message override) picks both the client and the model for that
//! call only.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::db::DatabaseType;
use crate::error::{NeoBaseError, Result};
use crate::llm::{
    claude::{ClaudeClient, ClaudeConfig},
    gemini::{GeminiClient, GeminiConfig},
    ollama::{OllamaClient, OllamaConfig},
    openai::{OpenAiClient, OpenAiConfig},
    AiResponse, LlmClient, LlmMessage, LlmProvider, ModelInfo, Recommendation, ResponseRequest,
    VisualizationRequest, VisualizationSpec,
};

/// One row of the static model catalog.
#[derive(Debug, Clone, Copy)]
pub struct ModelCatalogEntry {
    pub id: &'static str,
    pub provider: LlmProvider,
    pub display_name: &'static str,
    pub context_window: u32,
}

/// Models the backend knows how to route. Local servers accept any
/// model id and fall through to the ollama client.
const MODEL_CATALOG: &[ModelCatalogEntry] = &[
    ModelCatalogEntry {
        id: "gpt-4o",
        provider: LlmProvider::OpenAi,
        display_name: "GPT-4o",
        context_window: 128_000,
    },
    ModelCatalogEntry {
        id: "gpt-4o-mini",
        provider: LlmProvider::OpenAi,
        display_name: "GPT-4o mini",
        context_window: 128_000,
    },
    ModelCatalogEntry {
        id: "gpt-4.1",
        provider: LlmProvider::OpenAi,
        display_name: "GPT-4.1",
        context_window: 1_000_000,
    },
    ModelCatalogEntry {
        id: "claude-3-5-sonnet-latest",
        provider: LlmProvider::Claude,
        display_name: "Claude 3.5 Sonnet",
        context_window: 200_000,
    },
    ModelCatalogEntry {
        id: "claude-3-5-haiku-latest",
        provider: LlmProvider::Claude,
        display_name: "Claude 3.5 Haiku",
        context_window: 200_000,
    },
    ModelCatalogEntry {
        id: "gemini-2.0-flash",
        provider: LlmProvider::Gemini,
        display_name: "Gemini 2.0 Flash",
        context_window: 1_000_000,
    },
    ModelCatalogEntry {
        id: "gemini-1.5-pro",
        provider: LlmProvider::Gemini,
        display_name: "Gemini 1.5 Pro",
        context_window: 2_000_000,
    },
];

/// Registry of provider clients.
pub struct LlmManager {
    clients: HashMap<LlmProvider, Arc<dyn LlmClient>>,
    default_provider: LlmProvider,
    default_model: Option<String>,
}

impl LlmManager {
    /// Builds the registry from the environment configuration.
    ///
    /// A provider is registered only when the environment supplies its
    /// key (or base URL, for keyless local servers). At least one
    /// provider must come up.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let mut clients: HashMap<LlmProvider, Arc<dyn LlmClient>> = HashMap::new();

        if let Some(api_key) = &config.openai.api_key {
            let mut client_config = OpenAiConfig::new(api_key.clone());
            if let Some(base_url) = &config.openai.base_url {
                client_config = client_config.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.openai.default_model {
                client_config = client_config.with_model(model.clone());
            }
            clients.insert(
                LlmProvider::OpenAi,
                Arc::new(OpenAiClient::new(client_config)?),
            );
        }

        if let Some(api_key) = &config.claude.api_key {
            let mut client_config = ClaudeConfig::new(api_key.clone());
            if let Some(base_url) = &config.claude.base_url {
                client_config = client_config.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.claude.default_model {
                client_config = client_config.with_model(model.clone());
            }
            clients.insert(
                LlmProvider::Claude,
                Arc::new(ClaudeClient::new(client_config)?),
            );
        }

        if let Some(api_key) = &config.gemini.api_key {
            let mut client_config = GeminiConfig::new(api_key.clone());
            if let Some(base_url) = &config.gemini.base_url {
                client_config = client_config.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.gemini.default_model {
                client_config = client_config.with_model(model.clone());
            }
            clients.insert(
                LlmProvider::Gemini,
                Arc::new(GeminiClient::new(client_config)?),
            );
        }

        if config.ollama.is_enabled() {
            let mut client_config = OllamaConfig::new();
            if let Some(base_url) = &config.ollama.base_url {
                client_config = client_config.with_base_url(base_url.clone());
            }
            if let Some(model) = &config.ollama.default_model {
                client_config = client_config.with_model(model.clone());
            }
            clients.insert(
                LlmProvider::Ollama,
                Arc::new(OllamaClient::new(client_config)?),
            );
        }

        if clients.is_empty() {
            return Err(NeoBaseError::config(
                "No LLM provider configured. Set at least one provider API key.",
            ));
        }

        let default_provider = [
            LlmProvider::OpenAi,
            LlmProvider::Claude,
            LlmProvider::Gemini,
            LlmProvider::Ollama,
        ]
        .into_iter()
        .find(|p| clients.contains_key(p))
        .expect("at least one client registered");

        info!(
            providers = clients.len(),
            default = %default_provider,
            "LLM manager initialized"
        );

        Ok(Self {
            clients,
            default_provider,
            default_model: config.default_model.clone(),
        })
    }

    /// Builds a registry with only the mock client. Tests use this.
    pub fn mock(client: Arc<dyn LlmClient>) -> Self {
        let mut clients = HashMap::new();
        let provider = client.provider();
        clients.insert(provider, client);
        Self {
            clients,
            default_provider: provider,
            default_model: None,
        }
    }

    /// Returns the provider a model id belongs to.
    pub fn provider_for_model(model_id: &str) -> LlmProvider {
        if let Some(entry) = MODEL_CATALOG.iter().find(|entry| entry.id == model_id) {
            return entry.provider;
        }
        // Family prefixes cover ids newer than the catalog.
        if model_id.starts_with("gpt-") || model_id.starts_with("o1") || model_id.starts_with("o3")
        {
            LlmProvider::OpenAi
        } else if model_id.starts_with("claude-") {
            LlmProvider::Claude
        } else if model_id.starts_with("gemini-") {
            LlmProvider::Gemini
        } else {
            LlmProvider::Ollama
        }
    }

    /// Resolves a model id (or the default) to a registered client.
    pub fn client_for(&self, model_id: Option<&str>) -> Result<Arc<dyn LlmClient>> {
        let provider = match model_id {
            Some(id) => Self::provider_for_model(id),
            None => self.default_provider,
        };
        self.clients.get(&provider).cloned().ok_or_else(|| {
            NeoBaseError::config(format!(
                "No API key configured for provider '{provider}'"
            ))
        })
    }

    /// All models usable with the configured providers.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        let mut models: Vec<ModelInfo> = MODEL_CATALOG
            .iter()
            .filter(|entry| self.clients.contains_key(&entry.provider))
            .map(|entry| ModelInfo {
                id: entry.id.to_string(),
                provider: entry.provider.as_str().to_string(),
                display_name: entry.display_name.to_string(),
                context_window: entry.context_window,
            })
            .collect();

        // Local servers expose whatever model they were started with.
        if let Some(ollama) = self.clients.get(&LlmProvider::Ollama) {
            models.push(ollama.get_model_info());
        }
        models
    }

    /// Models for one provider, empty when it is not configured.
    pub fn list_models_for_provider(&self, provider: LlmProvider) -> Vec<ModelInfo> {
        self.list_models()
            .into_iter()
            .filter(|m| m.provider == provider.as_str())
            .collect()
    }

    /// Details for one model id, if it is usable.
    pub fn get_model_details(&self, model_id: &str) -> Option<ModelInfo> {
        self.list_models().into_iter().find(|m| m.id == model_id)
    }

    /// The model used when a chat has no preference.
    pub fn default_model(&self) -> ModelInfo {
        if let Some(id) = &self.default_model {
            if let Some(info) = self.get_model_details(id) {
                return info;
            }
        }
        self.clients[&self.default_provider].get_model_info()
    }

    /// Generates the structured response, routing by the request's
    /// model override.
    pub async fn generate_response(
        &self,
        ctx: &CancellationToken,
        request: &ResponseRequest,
    ) -> Result<AiResponse> {
        let client = self.client_for(request.model_override.as_deref())?;
        client.generate_response(ctx, request).await
    }

    /// Generates follow-up recommendations with the default client.
    pub async fn generate_recommendations(
        &self,
        ctx: &CancellationToken,
        messages: &[LlmMessage],
        db_type: DatabaseType,
        model_id: Option<&str>,
    ) -> Result<Vec<Recommendation>> {
        let client = self.client_for(model_id)?;
        client.generate_recommendations(ctx, messages, db_type).await
    }

    /// Generates a chart configuration, routing by the request's model
    /// override.
    pub async fn generate_visualization(
        &self,
        ctx: &CancellationToken,
        request: &VisualizationRequest,
    ) -> Result<VisualizationSpec> {
        let client = self.client_for(request.model_override.as_deref())?;
        client.generate_visualization(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_provider_for_model() {
        assert_eq!(
            LlmManager::provider_for_model("gpt-4o"),
            LlmProvider::OpenAi
        );
        assert_eq!(
            LlmManager::provider_for_model("gpt-5-preview"),
            LlmProvider::OpenAi
        );
        assert_eq!(
            LlmManager::provider_for_model("claude-3-5-sonnet-latest"),
            LlmProvider::Claude
        );
        assert_eq!(
            LlmManager::provider_for_model("gemini-2.0-flash"),
            LlmProvider::Gemini
        );
        assert_eq!(
            LlmManager::provider_for_model("llama3.1"),
            LlmProvider::Ollama
        );
    }

    #[test]
    fn test_mock_registry_routes_everything_to_mock() {
        let manager = LlmManager::mock(Arc::new(MockLlmClient::new()));
        assert!(manager.client_for(None).is_ok());
        // A model id for an unconfigured provider fails with a config
        // error instead of silently falling back.
        let err = manager.client_for(Some("gpt-4o")).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_default_model_comes_from_default_client() {
        let manager = LlmManager::mock(Arc::new(MockLlmClient::new()));
        assert_eq!(manager.default_model().id, "mock-1");
    }

    #[test]
    fn test_list_models_empty_for_unconfigured_providers() {
        let manager = LlmManager::mock(Arc::new(MockLlmClient::new()));
        assert!(manager.list_models_for_provider(LlmProvider::OpenAi).is_empty());
    }
}
