//! Execution result types shared by all drivers.
//!
//! A failed query does not unwind: drivers capture the failure as a
//! structured `QueryError` inside the result so the chat service can
//! attach it to the query and keep the assistant message.

use serde::{Deserialize, Serialize};

/// A result row as a uniform column-name → JSON value map.
///
/// Using JSON values keeps the surface identical across relational
/// drivers and MongoDB.
pub type RowMap = serde_json::Map<String, serde_json::Value>;

/// Classification a driver must perform on each query before it is
/// executed, because only writes are wrapped in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Reads run outside a wrapping transaction (driver permitting).
    Read,
    /// Data mutations; wrapped in a transaction by default.
    Write,
    /// Schema mutations; wrapped where the engine supports it.
    Ddl,
}

impl QueryType {
    /// Returns true if the query mutates data or schema.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Error classification for failed query executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorCode {
    Syntax,
    Permission,
    Timeout,
    ConnectionLost,
    Constraint,
    Other,
}

impl QueryErrorCode {
    /// Returns true if the manager should attempt one reconnect before
    /// surfacing the error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::ConnectionLost)
    }
}

/// Structured error carried inside a `QueryExecutionResult`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryError {
    pub code: QueryErrorCode,
    /// User-visible message, sanitized by the driver.
    pub message: String,
    /// Raw driver detail for logs and debugging panes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl QueryError {
    /// Creates an error with the given code and message.
    pub fn new(code: QueryErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attaches raw driver detail.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// The uniform result of executing one query through any driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryExecutionResult {
    /// Result rows; empty for writes.
    pub rows: Vec<RowMap>,
    /// Rows affected by a write, when the engine reports it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Present when the query failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl QueryExecutionResult {
    /// Creates a successful result carrying rows.
    pub fn with_rows(rows: Vec<RowMap>, execution_time_ms: u64) -> Self {
        Self {
            rows,
            affected_rows: None,
            execution_time_ms,
            error: None,
        }
    }

    /// Creates a successful result for a write.
    pub fn with_affected(affected: u64, execution_time_ms: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows: Some(affected),
            execution_time_ms,
            error: None,
        }
    }

    /// Creates a failed result.
    pub fn failed(error: QueryError, execution_time_ms: u64) -> Self {
        Self {
            rows: Vec::new(),
            affected_rows: None,
            execution_time_ms,
            error: Some(error),
        }
    }

    /// Returns true if the execution failed.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
