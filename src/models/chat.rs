//! Chats and their embedded connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SelectedTables;
use crate::config::SPREADSHEET_HOST;
use crate::db::DatabaseType;

/// Credentialed handle to an external database server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardConnection {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Stored encrypted; never serialized into outgoing responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub database: String,
    #[serde(default)]
    pub use_ssl: bool,
    /// PEM private key for an SSH tunnel, when the adapter layer
    /// provides one. Stored encrypted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_private_key: Option<String>,
}

/// Handle to a Google Sheets source. The sheet id and token pair
/// uniquely identify the source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleSheetsConnection {
    pub sheet_id: String,
    /// Stored encrypted; never serialized into outgoing responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Stored encrypted; never serialized into outgoing responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// A chat's data source, tagged over the supported driver kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Connection {
    Postgres(StandardConnection),
    Yugabyte(StandardConnection),
    Mysql(StandardConnection),
    Clickhouse(StandardConnection),
    Mongodb(StandardConnection),
    /// Uploaded tabular data in the internal store. The host is the
    /// reserved literal and the backing schema is provisioned lazily
    /// on first use.
    Spreadsheet,
    GoogleSheets(GoogleSheetsConnection),
}

impl Connection {
    /// Returns the driver kind behind this connection.
    pub fn database_type(&self) -> DatabaseType {
        match self {
            Self::Postgres(_) => DatabaseType::Postgres,
            Self::Yugabyte(_) => DatabaseType::Yugabyte,
            Self::Mysql(_) => DatabaseType::MySql,
            Self::Clickhouse(_) => DatabaseType::ClickHouse,
            Self::Mongodb(_) => DatabaseType::MongoDb,
            Self::Spreadsheet => DatabaseType::Spreadsheet,
            Self::GoogleSheets(_) => DatabaseType::GoogleSheets,
        }
    }

    /// Returns the host this connection points at.
    pub fn host(&self) -> &str {
        match self {
            Self::Postgres(c)
            | Self::Yugabyte(c)
            | Self::Mysql(c)
            | Self::Clickhouse(c)
            | Self::Mongodb(c) => &c.host,
            Self::Spreadsheet | Self::GoogleSheets(_) => SPREADSHEET_HOST,
        }
    }

    /// Returns a copy safe to serialize into an outgoing response:
    /// passwords, keys, and tokens are stripped.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        match &mut copy {
            Self::Postgres(c)
            | Self::Yugabyte(c)
            | Self::Mysql(c)
            | Self::Clickhouse(c)
            | Self::Mongodb(c) => {
                c.password = None;
                c.ssh_private_key = None;
            }
            Self::GoogleSheets(g) => {
                g.access_token = None;
                g.refresh_token = None;
            }
            Self::Spreadsheet => {}
        }
        copy
    }

    /// Returns true if this connection stores its data in the internal
    /// relational store.
    pub fn is_spreadsheet_backed(&self) -> bool {
        matches!(self, Self::Spreadsheet | Self::GoogleSheets(_))
    }
}

/// Per-chat behavior toggles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct ChatSettings {
    /// Execute LLM-generated queries without a confirming click.
    pub auto_execute_query: bool,
    /// Allow bounded example records to be sent to the provider.
    pub share_data_with_ai: bool,
    /// Simplified prompts and presentation.
    pub non_tech_mode: bool,
    /// Generate a chart configuration after successful execution.
    pub auto_generate_visualization: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            auto_execute_query: false,
            share_data_with_ai: false,
            non_tech_mode: false,
            auto_generate_visualization: false,
        }
    }
}

/// A persistent conversation bound to a single connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub connection: Connection,
    #[serde(default)]
    pub selected_tables: SelectedTables,
    #[serde(default)]
    pub settings: ChatSettings,
    /// Preferred model id; falls back to the environment default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    /// Name of the internal relational schema holding this chat's
    /// uploaded tables.
    pub fn spreadsheet_schema(&self) -> String {
        format!("conn_{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> StandardConnection {
        StandardConnection {
            host: "db.example.com".into(),
            port: 5432,
            username: "app".into(),
            password: Some("hunter2".into()),
            database: "prod".into(),
            use_ssl: true,
            ssh_private_key: None,
        }
    }

    #[test]
    fn test_redacted_strips_secrets() {
        let conn = Connection::Postgres(standard());
        let redacted = conn.redacted();
        match redacted {
            Connection::Postgres(c) => {
                assert!(c.password.is_none());
                assert_eq!(c.host, "db.example.com");
            }
            _ => panic!("variant changed by redaction"),
        }
    }

    #[test]
    fn test_redacted_strips_google_tokens() {
        let conn = Connection::GoogleSheets(GoogleSheetsConnection {
            sheet_id: "1abc".into(),
            access_token: Some("ya29.token".into()),
            refresh_token: Some("1//refresh".into()),
        });
        match conn.redacted() {
            Connection::GoogleSheets(g) => {
                assert!(g.access_token.is_none());
                assert!(g.refresh_token.is_none());
                assert_eq!(g.sheet_id, "1abc");
            }
            _ => panic!("variant changed by redaction"),
        }
    }

    #[test]
    fn test_spreadsheet_host_is_reserved() {
        assert_eq!(Connection::Spreadsheet.host(), SPREADSHEET_HOST);
    }

    #[test]
    fn test_database_type_mapping() {
        assert_eq!(
            Connection::Postgres(standard()).database_type(),
            DatabaseType::Postgres
        );
        assert_eq!(
            Connection::Spreadsheet.database_type(),
            DatabaseType::Spreadsheet
        );
    }

    #[test]
    fn test_spreadsheet_schema_name() {
        let chat = Chat {
            id: "64f0c0ffee".into(),
            user_id: "u1".into(),
            connection: Connection::Spreadsheet,
            selected_tables: SelectedTables::All,
            settings: ChatSettings::default(),
            model_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(chat.spreadsheet_schema(), "conn_64f0c0ffee");
    }

    #[test]
    fn test_connection_serde_tag() {
        let conn = Connection::Spreadsheet;
        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains("\"type\":\"spreadsheet\""));
    }
}
