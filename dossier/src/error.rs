use thiserror::Error;

use crate::types::{BatchId, KeywordId, RecordId, SearchId};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DossierError>;

/// Errors that can occur in the enrichment engine.
#[derive(Debug, Error)]
pub enum DossierError {
    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Batch not found
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Record not found
    #[error("Record not found: {0}")]
    RecordNotFound(RecordId),

    /// Async search request not found
    #[error("Search request not found: {0}")]
    SearchNotFound(SearchId),

    /// Exclusion keyword not found
    #[error("Keyword not found: {0}")]
    KeywordNotFound(KeywordId),

    /// Attempted to modify an entity in a terminal state
    #[error("Invalid state for {entity}: is {actual}, expected {expected}")]
    InvalidState {
        entity: String,
        actual: String,
        expected: String,
    },

    /// A uniqueness constraint was violated (duplicate keyword, search id, ...)
    #[error("Already exists: {0}")]
    Duplicate(String),

    /// Invalid caller-supplied parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Outbound collaborator call failed
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] crate::clients::ClientError),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
