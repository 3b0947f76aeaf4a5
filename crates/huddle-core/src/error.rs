//! Error types for huddle-core.

use thiserror::Error;

/// Result type alias using huddle-core Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for huddle operations
#[derive(Error, Debug)]
pub enum Error {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    // Validation / lookup errors
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(i64),

    #[error("Session is no longer active: {0}")]
    SessionEnded(String),

    #[error("Concurrent write conflict on session: {0}")]
    WriteConflict(String),

    #[error("A live stream is already open for session: {0}")]
    StreamBusy(String),

    // Merge engine errors
    #[error("Malformed model output: {0}")]
    MalformedModelOutput(String),

    #[error("Upstream generation error: {0}")]
    Upstream(String),

    // Auth errors
    #[error("Invalid token")]
    InvalidToken,

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}
