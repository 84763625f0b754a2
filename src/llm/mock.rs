//! Mock LLM client for tests.

use async_trait::async_trait;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::DatabaseType;
use crate::error::{NeoBaseError, Result};
use crate::llm::{
    AiResponse, AxisSpec, LlmClient, LlmMessage, LlmProvider, ModelInfo, QuerySpec,
    Recommendation, ResponseRequest, VisualizationRequest, VisualizationSpec,
};

/// Canned-answer client; records every request it sees.
pub struct MockLlmClient {
    response: AiResponse,
    fail_with: Option<String>,
    delay: Option<std::time::Duration>,
    /// Text of every user turn passed to `generate_response`.
    pub requests: Mutex<Vec<ResponseRequest>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    /// Creates a mock that answers with one SELECT query.
    pub fn new() -> Self {
        Self {
            response: AiResponse {
                assistant_message: "Here are all users.".to_string(),
                queries: vec![QuerySpec {
                    query: "SELECT * FROM users".to_string(),
                    query_type: Some("SELECT".to_string()),
                    tables: Some("users".to_string()),
                    explanation: Some("Fetches every user row.".to_string()),
                    rollback_query: None,
                }],
                action_buttons: vec![],
            },
            fail_with: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the canned response.
    pub fn with_response(mut self, response: AiResponse) -> Self {
        self.response = response;
        self
    }

    /// Makes `generate_response` take this long, observing the
    /// cancellation token while it waits.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every call fail with the given provider error, like an
    /// outage would.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            response: AiResponse {
                assistant_message: String::new(),
                queries: vec![],
                action_buttons: vec![],
            },
            fail_with: Some(message.into()),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn check_failure(&self) -> Result<()> {
        match &self.fail_with {
            Some(message) => Err(NeoBaseError::llm(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn provider(&self) -> LlmProvider {
        LlmProvider::Mock
    }

    fn get_model_info(&self) -> ModelInfo {
        ModelInfo {
            id: "mock-1".to_string(),
            provider: "mock".to_string(),
            display_name: "Mock model".to_string(),
            context_window: 8192,
        }
    }

    fn set_model(&self, _model_id: &str) {}

    async fn generate_response(
        &self,
        ctx: &CancellationToken,
        request: &ResponseRequest,
    ) -> Result<AiResponse> {
        if ctx.is_cancelled() {
            return Err(NeoBaseError::Cancelled);
        }
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = ctx.cancelled() => return Err(NeoBaseError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.check_failure()?;
        self.requests
            .lock()
            .expect("mock requests lock")
            .push(request.clone());
        Ok(self.response.clone())
    }

    async fn generate_recommendations(
        &self,
        ctx: &CancellationToken,
        _messages: &[LlmMessage],
        _db_type: DatabaseType,
    ) -> Result<Vec<Recommendation>> {
        if ctx.is_cancelled() {
            return Err(NeoBaseError::Cancelled);
        }
        self.check_failure()?;
        Ok(vec![
            Recommendation {
                text: "Show the most recent signups".to_string(),
                category: None,
            },
            Recommendation {
                text: "How many users are there in total?".to_string(),
                category: None,
            },
        ])
    }

    async fn generate_visualization(
        &self,
        ctx: &CancellationToken,
        _request: &VisualizationRequest,
    ) -> Result<VisualizationSpec> {
        if ctx.is_cancelled() {
            return Err(NeoBaseError::Cancelled);
        }
        self.check_failure()?;
        Ok(VisualizationSpec {
            chart_type: "bar".to_string(),
            x_axis: AxisSpec {
                column: "name".to_string(),
                label: None,
            },
            y_axis: vec![AxisSpec {
                column: "id".to_string(),
                label: Some("Id".to_string()),
            }],
            colors: vec!["#4e79a7".to_string()],
            fetch_query: "SELECT name, id FROM users LIMIT 100".to_string(),
            projected_row_count: Some(2),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_records_requests() {
        let client = MockLlmClient::new();
        let ctx = CancellationToken::new();
        let request = ResponseRequest {
            messages: vec![],
            db_type: DatabaseType::Postgres,
            non_tech_mode: true,
            schema_context: None,
            model_override: None,
        };
        client.generate_response(&ctx, &request).await.unwrap();
        let seen = client.requests.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].non_tech_mode);
    }

    #[tokio::test]
    async fn test_failing_mock() {
        let client = MockLlmClient::failing("service unavailable");
        let ctx = CancellationToken::new();
        let request = ResponseRequest {
            messages: vec![],
            db_type: DatabaseType::Postgres,
            non_tech_mode: false,
            schema_context: None,
            model_override: None,
        };
        let err = client.generate_response(&ctx, &request).await.unwrap_err();
        assert_eq!(err.code(), "LLM_ERROR");
    }

    #[tokio::test]
    async fn test_cancelled_mock() {
        let client = MockLlmClient::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let request = ResponseRequest {
            messages: vec![],
            db_type: DatabaseType::Postgres,
            non_tech_mode: false,
            schema_context: None,
            model_override: None,
        };
        let err = client.generate_response(&ctx, &request).await.unwrap_err();
        assert_eq!(err.code(), "CANCELLED");
    }
}
