//! Error types for the embeddings crate.

use thiserror::Error;

/// Result type alias for embedding operations.
pub type Result<T> = std::result::Result<T, EmbeddingError>;

/// Errors that can occur while producing or comparing embeddings.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    /// Vectors of different lengths were compared or stored together.
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding provider could not produce a vector.
    #[error("embedding provider failed: {0}")]
    Provider(String),
}
