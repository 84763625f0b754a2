//! System-prompt assembly.
//!
//! The prompt is built from (provider, database type, non-tech mode) at
//! call time, never cached per message, so a mode or connection change
//! takes effect on the very next turn.

use crate::db::DatabaseType;
use crate::llm::{LlmMessage, LlmProvider};
use crate::models::MessageRole;

/// Marker prepended to history entries whose mode differs from the
/// current request's.
const NON_TECH_MARKER: &str = "[non-technical mode]";
const TECH_MARKER: &str = "[technical mode]";

/// Builds the system prompt for a chat completion.
pub fn build_system_prompt(
    provider: LlmProvider,
    db_type: DatabaseType,
    non_tech_mode: bool,
    schema_context: Option<&str>,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are NeoBase, an AI copilot that helps users work with their data \
         by conversing in natural language.\n\n",
    );

    match db_type.sql_dialect() {
        Some(dialect) => {
            prompt.push_str(&format!(
                "The user's data source is {db_type}. Generate complete, executable \
                 {dialect} statements. Never invent tables or columns that are not in \
                 the schema.\n"
            ));
        }
        None => {
            prompt.push_str(
                "The user's data source is MongoDB. Generate queries as JSON command \
                 documents with 'collection', 'operation', and the operation's fields \
                 (filter, update, pipeline, documents). Never invent collections or \
                 fields that are not in the schema.\n",
            );
        }
    }

    prompt.push_str(
        "\nFor every query that modifies data, also produce a rollback_query that \
         restores the previous state. Reads take a null rollback_query.\n",
    );

    if non_tech_mode {
        prompt.push_str(
            "\nThe user is non-technical. Explain results in plain language, avoid \
             jargon, and keep query explanations short and friendly.\n",
        );
    } else {
        prompt.push_str(
            "\nThe user is comfortable with queries. Be precise and include brief \
             technical explanations where they help.\n",
        );
    }

    if let Some(schema) = schema_context {
        prompt.push_str("\n");
        prompt.push_str(schema);
        prompt.push('\n');
    }

    // Providers without native schema enforcement lean on the prompt;
    // it is harmless for the ones that have it.
    if matches!(provider, LlmProvider::Ollama) {
        prompt.push_str(
            "\nRespond with a single JSON object containing 'assistant_message', \
             'queries', and 'action_buttons'. Output nothing outside the JSON object.\n",
        );
    }

    prompt
}

/// Builds the system prompt for the recommendations call.
pub fn build_recommendations_prompt(db_type: DatabaseType) -> String {
    format!(
        "You are NeoBase. Based on the conversation so far and the {db_type} data \
         source, suggest up to three concise follow-up questions the user could ask \
         next. Each suggestion must be answerable from the schema discussed."
    )
}

/// Builds the system prompt for the visualization call.
pub fn build_visualization_prompt(db_type: DatabaseType) -> String {
    let dialect = db_type.sql_dialect().unwrap_or("the source's query language");
    format!(
        "You are NeoBase. Design a chart for the given query result. Choose the \
         chart type that best fits the data shape, bind axes to result columns, and \
         write a fetch_query in {dialect} that returns at most a few hundred rows, \
         aggregating where needed."
    )
}

/// A provider-agnostic wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Renders history entries to wire messages, annotating entries whose
/// stored mode differs from the current request's.
pub fn render_history(messages: &[LlmMessage], current_non_tech: bool) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|msg| {
            let text = msg.content_text();
            let content = if msg.non_tech_mode != current_non_tech {
                let marker = if msg.non_tech_mode {
                    NON_TECH_MARKER
                } else {
                    TECH_MARKER
                };
                format!("{marker} {text}")
            } else {
                text
            };
            WireMessage {
                role: msg.role,
                content,
            }
        })
        .collect()
}
