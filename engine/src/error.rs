//! Error types for the context engine.

use ctxflow_context::ContextError;
use ctxflow_storage::StorageError;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the context engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine was asked to use a collaborator it was built without.
    #[error("no {0} configured for this engine")]
    MissingComponent(&'static str),

    /// Chunking or context encoding failed.
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// A storage-backed retrieval failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The pipeline configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn is_missing_component(&self) -> bool {
        matches!(self, EngineError::MissingComponent(_))
    }
}
