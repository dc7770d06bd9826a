//! Error types for SelfHeal

use thiserror::Error;

/// Result type alias using SelfHeal Error
pub type Result<T> = std::result::Result<T, Error>;

/// SelfHeal error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Snapshot too large: {size} bytes exceeds limit of {limit} bytes")]
    SnapshotTooLarge { size: usize, limit: usize },

    #[error("Unsupported selector syntax: {0}")]
    UnsupportedSelectorSyntax(String),

    #[error("No candidates found for selector: {0}")]
    NoCandidatesFound(String),

    #[error("Test run {id} is not active (status: {status})")]
    RunNotActive { id: String, status: String },

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Resource already exists: {kind} with id {id}")]
    AlreadyExists { kind: String, id: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller can retry the operation without changing it.
    /// Storage faults are transient; everything else is a caller problem.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_))
    }
}
