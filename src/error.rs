//! Error types for AI Delegate.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Delegation error: {0}")]
    Delegation(#[from] DelegationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised while running a claimed task.
///
/// The `Display` output is persisted verbatim into the task's `error` column,
/// so messages are written for a person reading chat output.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("No executor registered for agent '{agent}'")]
    Unregistered { agent: String },

    #[error("{0}")]
    Failed(String),

    #[error("Executor '{agent}' timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("Executor '{agent}' panicked")]
    Panicked { agent: String },
}

impl ExecutorError {
    /// Shorthand for a plain failure message.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Channel delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("No notifier registered for channel '{name}'")]
    NotRegistered { name: String },

    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Delivery on channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl ChannelError {
    /// Whether a later attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotRegistered { .. })
    }
}

/// Errors from the per-turn delegation gate.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("Delegation limit reached: at most {max} new tasks per turn")]
    LimitReached { max: usize },

    #[error("Invalid delegation request: {0}")]
    InvalidRequest(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
