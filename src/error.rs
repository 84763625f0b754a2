//! Error types for the NeoBase core.
//!
//! Defines the main error enum used throughout the crate. Driver-level
//! query failures are not represented here: they travel as structured
//! data inside `QueryExecutionResult` so a failed query never unwinds
//! the execution path.

use thiserror::Error;

/// Main error type for NeoBase operations.
#[derive(Error, Debug)]
pub enum NeoBaseError {
    /// Request-shaped input that fails parsing or validation.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Missing, invalid, or expired credential; ownership violations.
    #[error("Access denied: {0}")]
    AuthDenied(String),

    /// Missing provider API key, no enabled model, bad environment.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transient driver failure (connection lost, timeout) after the
    /// single reconnect attempt has been consumed.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Permanent driver failure: auth to the underlying database,
    /// permission denied, invalid credentials.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution errors that escape the structured-result path
    /// (e.g. a rollback query that cannot even be submitted).
    #[error("Query error: {0}")]
    Query(String),

    /// Provider transport errors (rate limits, 5xx, network).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Provider returned output that does not parse or validate against
    /// the response schema. Retry-eligible by the user, never silently.
    #[error("LLM returned an invalid response: {0}")]
    LlmInvalidResponse(String),

    /// Persistence-layer failures (document store, key-value store).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Explicit cancel or upstream cancellation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Anything else; logged in full, generic message to the user.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl NeoBaseError {
    /// Creates an invalid-input error with the given message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates an auth-denied error with the given message.
    pub fn auth_denied(msg: impl Into<String>) -> Self {
        Self::AuthDenied(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a transient connection-lost error with the given message.
    pub fn connection_lost(msg: impl Into<String>) -> Self {
        Self::ConnectionLost(msg.into())
    }

    /// Creates a permanent connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates an LLM transport error with the given message.
    pub fn llm(msg: impl Into<String>) -> Self {
        Self::Llm(msg.into())
    }

    /// Creates an LLM invalid-response error with the given message.
    pub fn llm_invalid_response(msg: impl Into<String>) -> Self {
        Self::LlmInvalidResponse(msg.into())
    }

    /// Creates a storage error with the given message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the stable internal code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INPUT_INVALID",
            Self::AuthDenied(_) => "AUTH_DENIED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Query(_) => "QUERY_ERROR",
            Self::Llm(_) => "LLM_ERROR",
            Self::LlmInvalidResponse(_) => "LLM_INVALID_RESPONSE",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the failure is transient and worth a user retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_) | Self::Llm(_) | Self::LlmInvalidResponse(_)
        )
    }

    /// Returns the message shown to the user.
    ///
    /// Internal errors are collapsed to a generic line; everything else
    /// is already written to be user-visible.
    pub fn user_message(&self) -> String {
        match self {
            Self::Internal(_) => "Something went wrong. Please try again.".to_string(),
            other => other.to_string(),
        }
    }
}

/// Result type alias using NeoBaseError.
pub type Result<T> = std::result::Result<T, NeoBaseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(NeoBaseError::invalid_input("x").code(), "INPUT_INVALID");
        assert_eq!(NeoBaseError::auth_denied("x").code(), "AUTH_DENIED");
        assert_eq!(NeoBaseError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            NeoBaseError::llm_invalid_response("x").code(),
            "LLM_INVALID_RESPONSE"
        );
    }

    #[test]
    fn test_internal_error_is_masked_for_users() {
        let err = NeoBaseError::internal("poisoned lock in stream hub");
        assert!(!err.user_message().contains("poisoned"));
        assert!(err.to_string().contains("poisoned"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(NeoBaseError::connection_lost("x").is_retryable());
        assert!(NeoBaseError::llm("rate limited").is_retryable());
        assert!(!NeoBaseError::auth_denied("x").is_retryable());
        assert!(!NeoBaseError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NeoBaseError>();
    }
}
