use std::time::Duration;
use thiserror::Error;

/// Unified error type for the child scheduler and the services around it
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A resume callback fired for a parent that never created its cursor record
    #[error("Cursor state missing for parent node: {parent_node_id}")]
    MissingCursorState { parent_node_id: String },

    /// The per-parent lock could not be acquired within the wait timeout
    #[error("Timed out acquiring lock '{name}' after {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },

    /// The execution starter refused to start a child
    #[error("Execution starter failed for node {node_id}: {source}")]
    StarterFailure {
        node_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Malformed spawn request (neither or both variants, empty template id)
    #[error("Invalid spawn request: {0}")]
    InvalidSpawnRequest(String),

    /// The event bus rejected a publish
    #[error("Publish to '{topic}' failed: {reason}")]
    PublishFailure { topic: String, reason: String },

    /// Inbound event with an unknown type or an unreadable body
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SchedulerError {
    pub fn missing_cursor(parent_node_id: impl Into<String>) -> Self {
        Self::MissingCursorState {
            parent_node_id: parent_node_id.into(),
        }
    }

    pub fn lock_timeout(name: impl Into<String>, waited: Duration) -> Self {
        Self::LockTimeout {
            name: name.into(),
            waited_ms: waited.as_millis() as u64,
        }
    }

    pub fn starter_failure(node_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::StarterFailure {
            node_id: node_id.into(),
            source,
        }
    }

    pub fn publish_failure(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PublishFailure {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if redelivering the triggering event can succeed.
    ///
    /// Contract violations (missing cursor record, malformed spawn request,
    /// unknown event type) can never be fixed by a retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingCursorState { .. }
            | Self::InvalidSpawnRequest(_)
            | Self::InvalidEvent(_)
            | Self::Validation(_)
            | Self::Configuration(_)
            | Self::Serialization(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Internal(_) => false,

            Self::LockTimeout { .. }
            | Self::StarterFailure { .. }
            | Self::PublishFailure { .. }
            | Self::Database(_)
            | Self::Storage(_)
            | Self::Io(_) => true,

            Self::Other(_) => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::MissingCursorState { .. } => "missing_cursor_state",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::StarterFailure { .. } => "starter_failure",
            Self::InvalidSpawnRequest(_) => "invalid_spawn_request",
            Self::PublishFailure { .. } => "publish_failure",
            Self::InvalidEvent(_) => "invalid_event",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
            Self::Database(_) | Self::Storage(_) => "storage",
            Self::Serialization(_) | Self::Json(_) | Self::Yaml(_) => "serialization",
            Self::Io(_) => "io",
            Self::Internal(_) | Self::Other(_) => "internal",
        }
    }
}

impl From<bincode::Error> for SchedulerError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result type alias for SchedulerError
pub type Result<T> = std::result::Result<T, SchedulerError>;
