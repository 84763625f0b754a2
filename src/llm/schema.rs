//! JSON Schemas enforced on provider output.
//!
//! Each client hands these to its provider's strongest structured-
//! output mechanism (response_format, forced tool input, or response
//! schema), so the completion arrives as one validated JSON document.

use crate::db::DatabaseType;

/// Schema for the chat-completion response document.
pub fn response_schema(db_type: DatabaseType) -> serde_json::Value {
    let query_description = match db_type.sql_dialect() {
        Some(dialect) => format!("A complete, executable {dialect} statement."),
        None => "A JSON command document with 'collection', 'operation', and the \
                 operation's fields (filter, update, pipeline, documents)."
            .to_string(),
    };

    serde_json::json!({
        "type": "object",
        "properties": {
            "assistant_message": {
                "type": "string",
                "description": "Conversational reply shown to the user."
            },
            "queries": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": query_description},
                        "query_type": {
                            "type": "string",
                            "description": "Operation kind, e.g. SELECT, UPDATE, find, updateMany."
                        },
                        "tables": {
                            "type": "string",
                            "description": "Comma-separated tables or collections touched."
                        },
                        "explanation": {"type": "string"},
                        "rollback_query": {
                            "type": ["string", "null"],
                            "description": "Inverse query restoring the previous state. Required for every write, null for reads."
                        }
                    },
                    "required": ["query"],
                    "additionalProperties": false
                }
            },
            "action_buttons": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "label": {"type": "string"},
                        "action": {"type": "string"}
                    },
                    "required": ["label", "action"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["assistant_message"],
        "additionalProperties": false
    })
}

/// Schema for the recommendations document.
pub fn recommendations_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "recommendations": {
                "type": "array",
                "minItems": 1,
                "maxItems": 5,
                "items": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "category": {"type": "string"}
                    },
                    "required": ["text"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["recommendations"],
        "additionalProperties": false
    })
}

/// Schema for the visualization document.
pub fn visualization_schema() -> serde_json::Value {
    let axis = serde_json::json!({
        "type": "object",
        "properties": {
            "column": {"type": "string"},
            "label": {"type": "string"}
        },
        "required": ["column"],
        "additionalProperties": false
    });

    serde_json::json!({
        "type": "object",
        "properties": {
            "chart_type": {
                "type": "string",
                "enum": ["bar", "line", "area", "pie", "scatter"]
            },
            "x_axis": axis.clone(),
            "y_axis": {"type": "array", "minItems": 1, "items": axis},
            "colors": {"type": "array", "items": {"type": "string"}},
            "fetch_query": {
                "type": "string",
                "description": "Query optimized for chart data: aggregated and bounded."
            },
            "projected_row_count": {"type": "integer"}
        },
        "required": ["chart_type", "x_axis", "y_axis", "fetch_query"],
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_schema_mentions_dialect() {
        let pg = response_schema(DatabaseType::Postgres);
        let rendered = pg.to_string();
        assert!(rendered.contains("PostgreSQL"));

        let mongo = response_schema(DatabaseType::MongoDb);
        let rendered = mongo.to_string();
        assert!(rendered.contains("command document"));
    }

    #[test]
    fn test_schemas_are_objects_with_required() {
        for schema in [
            response_schema(DatabaseType::Postgres),
            recommendations_schema(),
            visualization_schema(),
        ] {
            assert_eq!(schema["type"], "object");
            assert!(schema["required"].is_array());
        }
    }
}
