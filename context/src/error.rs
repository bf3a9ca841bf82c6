//! Error types for the context model, chunkers and composers.

use thiserror::Error;

/// Result type alias for context operations.
pub type Result<T> = std::result::Result<T, ContextError>;

/// Errors that can occur while building, chunking or composing contexts.
#[derive(Error, Debug)]
pub enum ContextError {
    /// Chunk or compose options rejected at the boundary.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Unknown context type name.
    #[error("unknown context type: {0}")]
    UnknownContextType(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
