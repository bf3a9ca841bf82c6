//! Error types for storage backends.
//!
//! Backends report "not found" and "backend unavailable" as different
//! kinds. The collapsed `ContextStorage` methods still fold both into a
//! falsy result for callers that only want a bool/option/list.

use ctxflow_context::ContextError;
use ctxflow_embeddings::EmbeddingError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Result type alias for storage-client calls.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in a storage backend.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No context with this id.
    #[error("context not found: {0}")]
    NotFound(String),

    /// The underlying client failed or could not be reached.
    #[error("backend error: {0}")]
    Backend(#[from] ClientError),

    /// A stored context could not be decoded, or a context could not be encoded.
    #[error("context encoding error: {0}")]
    Encoding(#[from] ContextError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The storage was built without the backend this call needs.
    #[error("storage not configured: {0}")]
    NotConfigured(&'static str),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Errors raised by key-value and vector-store clients.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The backend could not be reached.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected the data it was given.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The collection's embedding hook failed.
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}
