//! Error Handling
//!
//! Unified error types for the service.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Retriable upstream failure (LLM 5xx, network glitch, cache disconnect)
    #[error("Transient error: {0}")]
    Transient(String),

    /// Non-retriable configuration or data-integrity failure
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Structured-output JSON failed schema validation after retries
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// Workflow ran past its superstep bound
    #[error("Iteration limit exceeded after {0} supersteps")]
    IterationLimitExceeded(u32),

    /// Agent hit its tool-call budget without producing a final answer
    #[error("Tool loop exhausted after {0} calls")]
    ToolLoopExhausted(u32),

    /// Emit on an event bus that has already been closed
    #[error("Event bus closed")]
    BusClosed,

    /// An invocation-boundary timeout expired
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unknown conversation, message, or agent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database errors
    #[error("Database error: {0}")]
    Database(String),

    /// SQLite errors (auto-converted from rusqlite::Error)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// File I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether a retry at the invocation boundary may succeed.
    /// Timeouts count as transient; everything else does not.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}
