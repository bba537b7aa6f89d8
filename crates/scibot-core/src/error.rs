//! Error types for scibot orchestration.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScibotError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid stage pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Unknown build group: {0}")]
    UnknownGroup(String),

    #[error("Invalid plugin spec {name:?}: {reason}")]
    InvalidPlugin { name: String, reason: String },

    #[error("Step {name:?} has an empty command")]
    EmptyCommand { name: String },

    #[error("Step {name:?} timed out after {timeout_secs} seconds")]
    StepTimeout { name: String, timeout_secs: u64 },

    #[error("Unknown builder: {0}")]
    UnknownBuilder(String),
}

/// Result type for scibot operations
pub type Result<T> = std::result::Result<T, ScibotError>;
