//! Chat service: the per-turn orchestrator.
//!
//! Owns the `IDLE -> ANALYZING -> RESPONDED -> [EXECUTING]* -> IDLE`
//! state machine for every user turn: prompt assembly, schema
//! injection, the provider call, persistence, and event emission. Turns
//! on one chat are serialized by a per-chat mutex held from ANALYZING
//! through RESPONDED; distinct chats run fully in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chat::classify_query;
use crate::db::{DbManager, QueryExecutionResult, QueryType};
use crate::error::{NeoBaseError, Result};
use crate::llm::{
    LlmManager, LlmMessage, Recommendation, ResponseRequest, VisualizationRequest,
};
use crate::models::{
    ActionButton, AxisConfig, Chat, ChartType, Message, MessageRole, Query, QueryStatus,
    Visualization,
};
use crate::storage::{ChatStore, LlmMessageStore, MessageStore, Stores, VisualizationStore};
use crate::stream::{AiResponsePayload, QueryResultPayload, StreamEvent, StreamHub};

/// Conversation window sent to the provider.
const HISTORY_WINDOW: usize = 20;

/// Rows sampled per table for share-data-with-AI schema context.
const EXAMPLE_RECORD_LIMIT: usize = 3;

/// Tables sampled for schema context.
const EXAMPLE_TABLE_LIMIT: usize = 5;

/// Rows kept as a query's stored example result.
const EXAMPLE_RESULT_ROWS: usize = 10;

/// The orchestrator.
pub struct ChatService {
    db: Arc<DbManager>,
    llm: Arc<LlmManager>,
    hub: Arc<StreamHub>,
    stores: Stores,
    turn_deadline: Duration,
    turn_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatService {
    /// Creates the service.
    pub fn new(
        db: Arc<DbManager>,
        llm: Arc<LlmManager>,
        hub: Arc<StreamHub>,
        stores: Stores,
        turn_deadline: Duration,
    ) -> Self {
        Self {
            db,
            llm,
            hub,
            stores,
            turn_deadline,
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    fn turn_lock(&self, chat_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.turn_locks
            .lock()
            .expect("turn locks")
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn owned_chat(&self, user_id: &str, chat_id: &str) -> Result<Chat> {
        let chat = self
            .stores
            .chats
            .get(chat_id)
            .await?
            .ok_or_else(|| NeoBaseError::invalid_input("Chat not found"))?;
        if chat.user_id != user_id {
            return Err(NeoBaseError::auth_denied("This chat belongs to another user"));
        }
        Ok(chat)
    }

    /// Handles a user prompt end to end.
    ///
    /// The user message is persisted immediately and returned; the
    /// assistant response arrives on the stream as `ai-response-step`
    /// progress events followed by exactly one terminal event.
    pub async fn send_message(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        content: &str,
    ) -> Result<Message> {
        if content.trim().is_empty() {
            return Err(NeoBaseError::invalid_input("Message content is empty"));
        }
        let chat = self.owned_chat(user_id, chat_id).await?;

        let user_message = Message::user(chat_id, content);
        self.stores.messages.insert(&user_message).await?;
        self.stores
            .llm_messages
            .append(&LlmMessage::new(
                chat_id,
                &user_message.id,
                MessageRole::User,
                serde_json::json!({"user_message": content}),
                chat.settings.non_tech_mode,
            ))
            .await?;

        self.run_turn(&chat, stream_id, &user_message, None).await;
        Ok(user_message)
    }

    /// Edits a user message and regenerates the downstream assistant
    /// message in place: same assistant id, cleared content and
    /// queries, events tagged with the original `user_message_id`.
    pub async fn edit_message(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        message_id: &str,
        new_content: &str,
    ) -> Result<Message> {
        if new_content.trim().is_empty() {
            return Err(NeoBaseError::invalid_input("Message content is empty"));
        }
        let chat = self.owned_chat(user_id, chat_id).await?;

        let mut user_message = self
            .stores
            .messages
            .get(chat_id, message_id)
            .await?
            .ok_or_else(|| NeoBaseError::invalid_input("Message not found"))?;
        if user_message.role != MessageRole::User {
            return Err(NeoBaseError::invalid_input(
                "Only user messages can be edited",
            ));
        }

        user_message.content = new_content.to_string();
        user_message.is_edited = true;
        user_message.updated_at = chrono::Utc::now();
        self.stores.messages.update(&user_message).await?;
        self.stores
            .llm_messages
            .replace_for_message(&LlmMessage::new(
                chat_id,
                &user_message.id,
                MessageRole::User,
                serde_json::json!({"user_message": new_content}),
                chat.settings.non_tech_mode,
            ))
            .await?;

        let downstream = self
            .stores
            .messages
            .find_assistant_for(chat_id, &user_message.id)
            .await?;
        let assistant_override = match downstream {
            Some(mut assistant) => {
                assistant.clear_for_regeneration();
                self.stores.messages.update(&assistant).await?;
                Some(assistant)
            }
            None => None,
        };

        self.run_turn(&chat, stream_id, &user_message, assistant_override)
            .await;
        Ok(user_message)
    }

    /// Cancels whatever is in flight on a stream. The turn pipeline
    /// observes the token and emits `response-cancelled` itself.
    pub fn cancel(&self, stream_id: &str) {
        self.hub.cancel(stream_id);
    }

    /// Runs one full turn: ANALYZING through RESPONDED (plus
    /// auto-execution), emitting exactly one terminal event.
    async fn run_turn(
        &self,
        chat: &Chat,
        stream_id: &str,
        user_message: &Message,
        assistant_override: Option<Message>,
    ) {
        let lock = self.turn_lock(&chat.id);
        let _guard = lock.lock().await;

        self.hub.begin_turn(stream_id);
        let ctx = self
            .hub
            .cancel_token(stream_id)
            .unwrap_or_default();

        let outcome = tokio::time::timeout(
            self.turn_deadline,
            self.analyze_and_respond(chat, stream_id, user_message, assistant_override, &ctx),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(NeoBaseError::Cancelled)) => {
                info!(chat_id = %chat.id, "Turn cancelled");
                self.hub.emit(
                    stream_id,
                    StreamEvent::ResponseCancelled {
                        user_message_id: user_message.id.clone(),
                    },
                );
            }
            Ok(Err(e)) => {
                warn!(chat_id = %chat.id, "Turn failed: {e}");
                self.hub.emit(
                    stream_id,
                    StreamEvent::AiResponseError {
                        code: e.code().to_string(),
                        message: e.user_message(),
                        user_message_id: user_message.id.clone(),
                    },
                );
            }
            Err(_) => {
                warn!(chat_id = %chat.id, "Turn exceeded the deadline");
                self.hub.emit(
                    stream_id,
                    StreamEvent::AiResponseError {
                        code: "TIMEOUT".to_string(),
                        message: "The request took too long. Please try again.".to_string(),
                        user_message_id: user_message.id.clone(),
                    },
                );
            }
        }
    }

    async fn analyze_and_respond(
        &self,
        chat: &Chat,
        stream_id: &str,
        user_message: &Message,
        assistant_override: Option<Message>,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let step = |text: &str| {
            self.hub.emit(
                stream_id,
                StreamEvent::AiResponseStep {
                    message: text.to_string(),
                    user_message_id: user_message.id.clone(),
                },
            );
        };

        step("NeoBase is analyzing your request...");

        // Schema injection, when a connection is live.
        let schema_context = if self.db.is_connected(&chat.id) {
            step("Fetching your database schema...");
            let schema = self
                .db
                .get_schema(ctx, &chat.id, &chat.selected_tables, false)
                .await?;
            let mut context = schema.format_for_llm();

            if chat.settings.share_data_with_ai {
                let mut samples = String::new();
                for table in schema.tables.keys().take(EXAMPLE_TABLE_LIMIT) {
                    if let Ok(rows) = self
                        .db
                        .fetch_example_records(ctx, &chat.id, table, EXAMPLE_RECORD_LIMIT)
                        .await
                    {
                        if !rows.is_empty() {
                            samples.push_str(&format!(
                                "{table}: {}\n",
                                serde_json::to_string(&rows).unwrap_or_default()
                            ));
                        }
                    }
                }
                if !samples.is_empty() {
                    context.push_str("\nExample records:\n");
                    context.push_str(&samples);
                }
            }
            Some(context)
        } else {
            None
        };

        let history = self
            .stores
            .llm_messages
            .list_recent(&chat.id, HISTORY_WINDOW)
            .await?;

        step("Generating a response...");
        let request = ResponseRequest {
            messages: history,
            db_type: chat.connection.database_type(),
            non_tech_mode: chat.settings.non_tech_mode,
            schema_context,
            model_override: chat.model_id.clone(),
        };
        let response = self.llm.generate_response(ctx, &request).await?;

        step("Processing the response...");
        let queries: Vec<Query> = response
            .queries
            .iter()
            .map(|spec| Query {
                id: Uuid::new_v4().to_string(),
                query: spec.query.clone(),
                query_type: spec.query_type.clone(),
                tables: spec.tables.clone(),
                rollback_query: spec.rollback_query.clone(),
                example_result: None,
                status: QueryStatus::Pending,
                execution_time_ms: None,
                error: None,
                visualization_id: None,
            })
            .collect();
        let action_buttons: Vec<ActionButton> = response
            .action_buttons
            .iter()
            .map(|spec| ActionButton {
                id: Uuid::new_v4().to_string(),
                label: spec.label.clone(),
                action: spec.action.clone(),
                is_primary: false,
            })
            .collect();

        let regenerating = assistant_override.is_some();
        let mut assistant = match assistant_override {
            Some(mut existing) => {
                existing.content = response.assistant_message.clone();
                existing
            }
            None => Message::assistant(
                &chat.id,
                response.assistant_message.clone(),
                &user_message.id,
            ),
        };
        assistant.queries = (!queries.is_empty()).then(|| queries.clone());
        assistant.action_buttons = (!action_buttons.is_empty()).then_some(action_buttons);
        assistant.updated_at = chrono::Utc::now();

        if regenerating {
            // Regeneration path: the row already exists.
            self.stores.messages.update(&assistant).await?;
        } else {
            self.stores.messages.insert(&assistant).await?;
        }
        self.stores
            .llm_messages
            .replace_for_message(&LlmMessage::new(
                &chat.id,
                &assistant.id,
                MessageRole::Assistant,
                serde_json::to_value(&response).unwrap_or_default(),
                chat.settings.non_tech_mode,
            ))
            .await?;

        self.hub.emit(
            stream_id,
            StreamEvent::AiResponse(AiResponsePayload {
                message_id: assistant.id.clone(),
                content: assistant.content.clone(),
                queries: assistant.queries.clone(),
                action_buttons: assistant.action_buttons.clone(),
                user_message_id: user_message.id.clone(),
                non_tech_mode: chat.settings.non_tech_mode,
                action_at: chrono::Utc::now(),
            }),
        );

        // EXECUTING: reads run immediately; writes wait for a click
        // unless auto-execute is on.
        if self.db.is_connected(&chat.id) {
            for query in &queries {
                let query_type = classify_query(chat.connection.database_type(), &query.query);
                let auto = !query_type.is_mutating() || chat.settings.auto_execute_query;
                if !auto {
                    continue;
                }
                if let Err(e) = self
                    .run_query(chat, stream_id, &mut assistant, &query.id, false, ctx)
                    .await
                {
                    warn!(chat_id = %chat.id, query_id = %query.id, "Auto-execution failed: {e}");
                }
            }
        }

        Ok(())
    }

    /// Executes one query from an assistant message on user request.
    pub async fn execute_query(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        message_id: &str,
        query_id: &str,
    ) -> Result<QueryExecutionResult> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let mut message = self
            .stores
            .messages
            .get(chat_id, message_id)
            .await?
            .ok_or_else(|| NeoBaseError::invalid_input("Message not found"))?;
        let ctx = self.hub.cancel_token(stream_id).unwrap_or_default();
        self.run_query(&chat, stream_id, &mut message, query_id, false, &ctx)
            .await
    }

    /// Invokes a query's rollback query. A rollback is a normal
    /// execution tagged `rollback`.
    pub async fn rollback_query(
        &self,
        user_id: &str,
        chat_id: &str,
        stream_id: &str,
        message_id: &str,
        query_id: &str,
    ) -> Result<QueryExecutionResult> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let mut message = self
            .stores
            .messages
            .get(chat_id, message_id)
            .await?
            .ok_or_else(|| NeoBaseError::invalid_input("Message not found"))?;
        let ctx = self.hub.cancel_token(stream_id).unwrap_or_default();
        self.run_query(&chat, stream_id, &mut message, query_id, true, &ctx)
            .await
    }

    async fn run_query(
        &self,
        chat: &Chat,
        stream_id: &str,
        message: &mut Message,
        query_id: &str,
        rollback: bool,
        ctx: &CancellationToken,
    ) -> Result<QueryExecutionResult> {
        let query = message
            .query(query_id)
            .ok_or_else(|| NeoBaseError::invalid_input("Query not found"))?
            .clone();

        let text = if rollback {
            query.rollback_query.clone().ok_or_else(|| {
                NeoBaseError::invalid_input("This query has no rollback query")
            })?
        } else {
            query.query.clone()
        };

        let query_type = classify_query(chat.connection.database_type(), &text);
        let result = self
            .db
            .execute_query(ctx, &chat.id, &text, query_type, false)
            .await?;

        if let Some(stored) = message.query_mut(query_id) {
            stored.execution_time_ms = Some(result.execution_time_ms);
            if let Some(error) = &result.error {
                stored.status = QueryStatus::Failed;
                stored.error = Some(error.clone());
            } else {
                stored.status = if rollback {
                    QueryStatus::RolledBack
                } else {
                    QueryStatus::Executed
                };
                stored.error = None;
                if !rollback && !result.rows.is_empty() {
                    let sample: Vec<_> =
                        result.rows.iter().take(EXAMPLE_RESULT_ROWS).cloned().collect();
                    stored.example_result = serde_json::to_value(sample).ok();
                }
            }
        }
        message.updated_at = chrono::Utc::now();
        self.stores.messages.update(message).await?;

        self.hub.emit(
            stream_id,
            StreamEvent::QueryResult(QueryResultPayload {
                message_id: message.id.clone(),
                query_id: query_id.to_string(),
                tag: if rollback { "rollback" } else { "execute" }.to_string(),
                result: result.clone(),
            }),
        );

        Ok(result)
    }

    /// Suggests follow-up questions for a chat.
    pub async fn generate_recommendations(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Vec<Recommendation>> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let history = self
            .stores
            .llm_messages
            .list_recent(chat_id, HISTORY_WINDOW)
            .await?;
        let ctx = CancellationToken::new();
        self.llm
            .generate_recommendations(
                &ctx,
                &history,
                chat.connection.database_type(),
                chat.model_id.as_deref(),
            )
            .await
    }

    /// Generates (or regenerates) the chart configuration for one
    /// query.
    pub async fn generate_visualization(
        &self,
        user_id: &str,
        chat_id: &str,
        message_id: &str,
        query_id: &str,
    ) -> Result<Visualization> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let mut message = self
            .stores
            .messages
            .get(chat_id, message_id)
            .await?
            .ok_or_else(|| NeoBaseError::invalid_input("Message not found"))?;
        let query = message
            .query(query_id)
            .ok_or_else(|| NeoBaseError::invalid_input("Query not found"))?
            .clone();

        let ctx = CancellationToken::new();

        // Sample the live result so the model sees real columns.
        let sample = self
            .db
            .execute_query(&ctx, chat_id, &query.query, QueryType::Read, false)
            .await?;
        if let Some(error) = sample.error {
            return Err(NeoBaseError::query(error.message));
        }
        let columns: Vec<String> = sample
            .rows
            .first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default();
        let sample_rows = serde_json::to_value(
            sample.rows.iter().take(EXAMPLE_RESULT_ROWS).collect::<Vec<_>>(),
        )
        .unwrap_or_default();

        let spec = self
            .llm
            .generate_visualization(
                &ctx,
                &VisualizationRequest {
                    db_type: chat.connection.database_type(),
                    query: query.query.clone(),
                    columns,
                    sample_rows,
                    model_override: chat.model_id.clone(),
                },
            )
            .await?;

        let chart_type = parse_chart_type(&spec.chart_type)?;
        let viz = Visualization {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            query_id: Some(query_id.to_string()),
            chart_type,
            x_axis: AxisConfig {
                column: spec.x_axis.column,
                label: spec.x_axis.label,
            },
            y_axis: spec
                .y_axis
                .into_iter()
                .map(|axis| AxisConfig {
                    column: axis.column,
                    label: axis.label,
                })
                .collect(),
            colors: spec.colors,
            fetch_query: spec.fetch_query,
            projected_row_count: spec.projected_row_count,
            created_at: chrono::Utc::now(),
        };
        self.stores.visualizations.insert(&viz).await?;

        if let Some(stored) = message.query_mut(query_id) {
            stored.visualization_id = Some(viz.id.clone());
        }
        self.stores.messages.update(&message).await?;

        Ok(viz)
    }

    /// Runs a visualization's fetch query and returns the chart data.
    pub async fn fetch_chart_data(
        &self,
        user_id: &str,
        chat_id: &str,
        visualization_id: &str,
    ) -> Result<QueryExecutionResult> {
        let _chat = self.owned_chat(user_id, chat_id).await?;
        let viz = self
            .stores
            .visualizations
            .get(visualization_id)
            .await?
            .filter(|v| v.chat_id == chat_id)
            .ok_or_else(|| NeoBaseError::invalid_input("Visualization not found"))?;

        let ctx = CancellationToken::new();
        self.db
            .execute_query(&ctx, chat_id, &viz.fetch_query, QueryType::Read, false)
            .await
    }

    /// Checks for schema drift and pushes a system message when tables
    /// changed underneath the chat.
    pub async fn refresh_schema(&self, user_id: &str, chat_id: &str) -> Result<Vec<String>> {
        let _chat = self.owned_chat(user_id, chat_id).await?;
        let ctx = CancellationToken::new();
        let changed = self.db.detect_schema_drift(&ctx, chat_id).await?;
        if !changed.is_empty() {
            self.hub.emit_to_chat(
                chat_id,
                StreamEvent::SystemMessage {
                    message: format!(
                        "The database schema changed ({}). Consider refreshing.",
                        changed.join(", ")
                    ),
                },
            );
        }
        Ok(changed)
    }

    /// Clears a chat's message history, keeping the chat itself.
    pub async fn clear_messages(&self, user_id: &str, chat_id: &str) -> Result<()> {
        let _chat = self.owned_chat(user_id, chat_id).await?;
        self.stores.messages.delete_for_chat(chat_id).await?;
        self.stores.llm_messages.delete_for_chat(chat_id).await?;
        self.stores.visualizations.delete_for_chat(chat_id).await?;
        Ok(())
    }

    /// Deletes a chat and everything it owns: history, visualizations,
    /// and (for spreadsheet connections) the backing schema.
    pub async fn delete_chat(&self, user_id: &str, chat_id: &str) -> Result<()> {
        let chat = self.owned_chat(user_id, chat_id).await?;
        let ctx = CancellationToken::new();

        self.stores.messages.delete_for_chat(chat_id).await?;
        self.stores.llm_messages.delete_for_chat(chat_id).await?;
        self.stores.visualizations.delete_for_chat(chat_id).await?;

        if chat.connection.is_spreadsheet_backed() {
            if let Err(e) = self.db.delete_connection_data(&ctx, chat_id).await {
                warn!(chat_id, "Spreadsheet teardown failed: {e}");
            }
        } else {
            let _ = self.db.disconnect(chat_id).await;
        }

        self.stores.chats.delete(chat_id).await?;
        self.turn_locks.lock().expect("turn locks").remove(chat_id);
        Ok(())
    }
}

fn parse_chart_type(raw: &str) -> Result<ChartType> {
    match raw {
        "bar" => Ok(ChartType::Bar),
        "line" => Ok(ChartType::Line),
        "area" => Ok(ChartType::Area),
        "pie" => Ok(ChartType::Pie),
        "scatter" => Ok(ChartType::Scatter),
        other => Err(NeoBaseError::llm_invalid_response(format!(
            "unknown chart type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseType, DriverFactory, DriverRegistry, MockDriver};
    use crate::llm::MockLlmClient;
    use crate::models::{ChatSettings, Connection, SelectedTables, StandardConnection};
    use crate::storage::MemoryStores;
    use async_trait::async_trait;

    struct MockFactory;

    #[async_trait]
    impl DriverFactory for MockFactory {
        async fn connect(
            &self,
            _conn: &Connection,
            _chat_id: &str,
        ) -> Result<Box<dyn crate::db::DatabaseDriver>> {
            Ok(Box::new(MockDriver::new()))
        }
    }

    fn postgres_connection() -> Connection {
        Connection::Postgres(StandardConnection {
            host: "localhost".into(),
            port: 5432,
            username: "neo".into(),
            password: None,
            database: "app".into(),
            use_ssl: false,
            ssh_private_key: None,
        })
    }

    async fn service_with(
        llm_client: Arc<dyn crate::llm::LlmClient>,
        settings: ChatSettings,
    ) -> (Arc<ChatService>, Arc<StreamHub>, Stores, Chat) {
        let mut registry = DriverRegistry::new();
        registry.register(DatabaseType::Postgres, Arc::new(MockFactory));
        let db = Arc::new(DbManager::new(registry));

        let hub = StreamHub::new(Duration::from_secs(300));
        let stores = MemoryStores::new().into_stores();
        let llm = Arc::new(LlmManager::mock(llm_client));

        let chat = Chat {
            id: "c1".into(),
            user_id: "u1".into(),
            connection: postgres_connection(),
            selected_tables: SelectedTables::All,
            settings,
            model_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        stores.chats.insert(&chat).await.unwrap();
        db.connect("c1", chat.connection.clone()).await.unwrap();

        let service = Arc::new(ChatService::new(
            db,
            llm,
            hub.clone(),
            stores.clone(),
            Duration::from_secs(60),
        ));
        (service, hub, stores, chat)
    }

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_happy_path_emits_steps_then_single_terminal() {
        let (service, hub, _stores, _chat) =
            service_with(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
        let mut rx = hub.register("s1", "c1", "u1");

        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();

        let events = drain(&mut rx);
        let steps = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::AiResponseStep { .. }))
            .count();
        assert!(steps >= 2, "expected progress steps, got {events:?}");

        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        match terminals[0] {
            StreamEvent::AiResponse(payload) => {
                assert_eq!(payload.content, "Here are all users.");
                assert!(payload.queries.as_ref().unwrap().len() == 1);
            }
            other => panic!("expected ai-response, got {other:?}"),
        }

        // The read query auto-executed and produced a query-result.
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::QueryResult(p) if p.tag == "execute")));
    }

    #[tokio::test]
    async fn test_provider_outage_keeps_user_message() {
        let (service, hub, stores, _chat) = service_with(
            Arc::new(MockLlmClient::failing("upstream 502")),
            ChatSettings::default(),
        )
        .await;
        let mut rx = hub.register("s1", "c1", "u1");

        let user_message = service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();

        let events = drain(&mut rx);
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            terminals[0],
            StreamEvent::AiResponseError { code, .. } if code == "LLM_ERROR"
        ));

        // User message persisted, no assistant message written.
        let recent = stores.messages.list_recent("c1", 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, user_message.id);
    }

    #[tokio::test]
    async fn test_cancel_mid_analyze_emits_cancelled() {
        let (service, hub, stores, _chat) = service_with(
            Arc::new(MockLlmClient::new().with_delay(Duration::from_secs(30))),
            ChatSettings::default(),
        )
        .await;
        let mut rx = hub.register("s1", "c1", "u1");

        let running = service.clone();
        let handle = tokio::spawn(async move {
            running
                .send_message("u1", "c1", "s1", "Show me all users")
                .await
        });

        // Wait for ANALYZING to start, then cancel mid-LLM.
        loop {
            match rx.recv().await.unwrap() {
                StreamEvent::AiResponseStep { .. } => break,
                other => panic!("unexpected event before first step: {other:?}"),
            }
        }
        service.cancel("s1");
        handle.await.unwrap().unwrap();

        let events = drain(&mut rx);
        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(
            terminals[0],
            StreamEvent::ResponseCancelled { .. }
        ));

        let recent = stores.messages.list_recent("c1", 10).await.unwrap();
        assert_eq!(recent.len(), 1, "assistant message must not be persisted");
    }

    #[tokio::test]
    async fn test_turn_proceeds_after_earlier_cancel() {
        let (service, hub, _stores, _chat) =
            service_with(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
        let mut rx = hub.register("s1", "c1", "u1");

        // An earlier cancel re-arms the token; the next turn is clean.
        service.cancel("s1");
        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::AiResponse(_))));
    }

    #[tokio::test]
    async fn test_edit_regenerates_in_place() {
        let (service, hub, stores, _chat) =
            service_with(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
        let mut rx = hub.register("s1", "c1", "u1");

        let user_message = service
            .send_message("u1", "c1", "s1", "top 10 orders")
            .await
            .unwrap();
        drain(&mut rx);

        let original_assistant = stores
            .messages
            .find_assistant_for("c1", &user_message.id)
            .await
            .unwrap()
            .unwrap();

        service
            .edit_message("u1", "c1", "s1", &user_message.id, "top 5 orders")
            .await
            .unwrap();
        let events = drain(&mut rx);

        // Events are tagged with the original user message id.
        assert!(events.iter().all(|e| match e {
            StreamEvent::AiResponseStep {
                user_message_id, ..
            } => user_message_id == &user_message.id,
            _ => true,
        }));

        let regenerated = stores
            .messages
            .find_assistant_for("c1", &user_message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(regenerated.id, original_assistant.id);

        let edited = stores
            .messages
            .get("c1", &user_message.id)
            .await
            .unwrap()
            .unwrap();
        assert!(edited.is_edited);
        assert_eq!(edited.content, "top 5 orders");
    }

    #[tokio::test]
    async fn test_execute_and_rollback_tagging() {
        let response = crate::llm::AiResponse {
            assistant_message: "Uppercasing names.".into(),
            queries: vec![crate::llm::QuerySpec {
                query: "UPDATE users SET name = upper(name)".into(),
                query_type: Some("UPDATE".into()),
                tables: Some("users".into()),
                explanation: None,
                rollback_query: Some("UPDATE users SET name = lower(name)".into()),
            }],
            action_buttons: vec![],
        };
        let (service, hub, stores, _chat) = service_with(
            Arc::new(MockLlmClient::new().with_response(response)),
            ChatSettings::default(),
        )
        .await;
        let mut rx = hub.register("s1", "c1", "u1");

        service
            .send_message("u1", "c1", "s1", "Set every user's name to uppercase")
            .await
            .unwrap();
        let events = drain(&mut rx);

        // Write query: no auto-execution without the setting.
        assert!(!events
            .iter()
            .any(|e| matches!(e, StreamEvent::QueryResult(_))));

        let assistant = stores.messages.list_recent("c1", 10).await.unwrap()[1].clone();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        let result = service
            .execute_query("u1", "c1", "s1", &assistant.id, &query_id)
            .await
            .unwrap();
        assert_eq!(result.affected_rows, Some(2));

        let stored = stores
            .messages
            .get("c1", &assistant.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.query(&query_id).unwrap().status, QueryStatus::Executed);

        let rollback = service
            .rollback_query("u1", "c1", "s1", &assistant.id, &query_id)
            .await
            .unwrap();
        assert!(!rollback.is_error());

        let stored = stores
            .messages
            .get("c1", &assistant.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.query(&query_id).unwrap().status,
            QueryStatus::RolledBack
        );

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::QueryResult(p) if p.tag == "execute")));
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::QueryResult(p) if p.tag == "rollback")));
    }

    #[tokio::test]
    async fn test_ownership_is_enforced() {
        let (service, _hub, _stores, _chat) =
            service_with(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
        let err = service
            .send_message("intruder", "c1", "s1", "hi")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUTH_DENIED");
    }

    #[tokio::test]
    async fn test_share_data_setting_gates_samples() {
        let client = Arc::new(MockLlmClient::new());
        let (service, _hub, _stores, _chat) = service_with(
            client.clone(),
            ChatSettings {
                share_data_with_ai: true,
                ..Default::default()
            },
        )
        .await;
        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();
        let requests = client.requests.lock().unwrap();
        let context = requests[0].schema_context.as_deref().unwrap();
        assert!(context.contains("Example records"));
        assert!(context.contains("Alice"));
    }

    #[tokio::test]
    async fn test_no_samples_without_share_data() {
        let client = Arc::new(MockLlmClient::new());
        let (service, _hub, _stores, _chat) =
            service_with(client.clone(), ChatSettings::default()).await;
        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();
        let requests = client.requests.lock().unwrap();
        let context = requests[0].schema_context.as_deref().unwrap();
        assert!(context.contains("Database Schema"));
        assert!(!context.contains("Example records"));
    }

    #[tokio::test]
    async fn test_visualization_flow() {
        let (service, _hub, stores, _chat) =
            service_with(Arc::new(MockLlmClient::new()), ChatSettings::default()).await;
        service
            .send_message("u1", "c1", "s1", "Show me all users")
            .await
            .unwrap();
        let assistant = stores.messages.list_recent("c1", 10).await.unwrap()[1].clone();
        let query_id = assistant.queries.as_ref().unwrap()[0].id.clone();

        let viz = service
            .generate_visualization("u1", "c1", &assistant.id, &query_id)
            .await
            .unwrap();
        assert_eq!(viz.query_id.as_deref(), Some(query_id.as_str()));
        assert_eq!(viz.chart_type, ChartType::Bar);

        let stored = stores
            .messages
            .get("c1", &assistant.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.query(&query_id).unwrap().visualization_id.as_deref(),
            Some(viz.id.as_str())
        );

        let data = service
            .fetch_chart_data("u1", "c1", &viz.id)
            .await
            .unwrap();
        assert!(!data.rows.is_empty());
    }
}
