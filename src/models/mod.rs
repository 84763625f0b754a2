//! Persistent data model for the NeoBase core.
//!
//! These types are the in-memory form of the entities the backend owns.
//! Serialization to the document-store form happens at the storage
//! boundary; sensitive connection fields are encrypted there and
//! redacted before anything is sent back to a client.

mod chat;
mod message;
mod user;
mod visualization;

pub use chat::{Chat, ChatSettings, Connection, GoogleSheetsConnection, StandardConnection};
pub use message::{ActionButton, Message, MessageRole, Query, QueryStatus};
pub use user::User;
pub use visualization::{AxisConfig, ChartType, Visualization};

use serde::{Deserialize, Serialize};

/// The selected-collections filter on a chat: either everything, or an
/// ordered list of table names.
///
/// The wire form is the literal string `"ALL"` or a comma-separated
/// list, which is preserved round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectedTables {
    #[default]
    All,
    Listed(Vec<String>),
}

impl SelectedTables {
    /// Parses the stored filter value.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ALL") {
            return Self::All;
        }
        Self::Listed(
            trimmed
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        )
    }

    /// Returns the wire form of the filter.
    pub fn to_wire(&self) -> String {
        match self {
            Self::All => "ALL".to_string(),
            Self::Listed(tables) => tables.join(","),
        }
    }

    /// Returns true if the given table passes the filter.
    pub fn includes(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Listed(tables) => tables.iter().any(|t| t == table),
        }
    }
}

impl Serialize for SelectedTables {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

impl<'de> Deserialize<'de> for SelectedTables {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
