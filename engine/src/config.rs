//! Configuration for a context pipeline.
//!
//! Every field has a default, so a TOML file only needs the keys it
//! changes:
//!
//! ```toml
//! [chunker]
//! chunk_size = 400
//! chunk_overlap = 50
//!
//! [composer]
//! strategy = "hierarchical"
//!
//! [storage]
//! cache_ttl_secs = 60
//! ```

use std::path::Path;

use ctxflow_context::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_CODE_LANGUAGE};
use ctxflow_context::composer::{DEFAULT_INDENT, DEFAULT_MAX_DEPTH, DEFAULT_SEPARATOR};
use ctxflow_context::{ChunkOptions, ChunkStrategy, ComposeOptions, ContextType};
use ctxflow_embeddings::provider::DEFAULT_HASHING_DIMENSION;
use ctxflow_storage::KeyValueStorageConfig;
use ctxflow_storage::hybrid::DEFAULT_CACHE_TTL_SECS;
use ctxflow_storage::kv::{DEFAULT_INDEX_PREFIX, DEFAULT_KEY_PREFIX};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default capacity of an engine's in-memory context map.
pub const DEFAULT_MAX_CACHED_CONTEXTS: usize = 1024;

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunker: ChunkerConfig,
    pub composer: ComposerConfig,
    pub storage: StorageConfig,
    pub engine: EngineConfig,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    pub fn with_chunker(mut self, chunker: ChunkerConfig) -> Self {
        self.chunker = chunker;
        self
    }

    pub fn with_composer(mut self, composer: ComposerConfig) -> Self {
        self.composer = composer;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_max_cached_contexts(mut self, max_cached_contexts: usize) -> Self {
        self.engine.max_cached_contexts = max_cached_contexts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Strategy for non-code contexts.
    pub text_strategy: ChunkStrategy,
    /// Strategy for code contexts.
    pub code_strategy: ChunkStrategy,
    pub language: String,
    /// When set, text is chunked by the semantic chunker.
    pub embedding_model: Option<String>,
}

impl ChunkerConfig {
    /// Options that reproduce this config for a single `chunk` call.
    pub fn chunk_options(&self, context_type: ContextType) -> ChunkOptions {
        let options = ChunkOptions::new()
            .with_size(self.chunk_size)
            .with_overlap(self.chunk_overlap);
        match context_type {
            ContextType::Code => options
                .with_strategy(self.code_strategy)
                .with_language(self.language.as_str()),
            _ => options.with_strategy(self.text_strategy),
        }
    }
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            text_strategy: ChunkStrategy::Paragraph,
            code_strategy: ChunkStrategy::Function,
            language: DEFAULT_CODE_LANGUAGE.to_string(),
            embedding_model: None,
        }
    }
}

/// Which composer an engine is built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposerStrategy {
    #[default]
    Sequential,
    Hierarchical,
    Semantic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposerConfig {
    pub strategy: ComposerStrategy,
    pub separator: String,
    pub indent_string: String,
    pub max_depth: usize,
    pub embedding_model: Option<String>,
}

impl ComposerConfig {
    pub fn compose_options(&self) -> ComposeOptions {
        let options = ComposeOptions::new()
            .with_separator(self.separator.as_str())
            .with_indent(self.indent_string.as_str())
            .with_max_depth(self.max_depth);
        match &self.embedding_model {
            Some(model) => options.with_embedding_model(model.as_str()),
            None => options,
        }
    }
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            strategy: ComposerStrategy::Sequential,
            separator: DEFAULT_SEPARATOR.to_string(),
            indent_string: DEFAULT_INDENT.to_string(),
            max_depth: DEFAULT_MAX_DEPTH,
            embedding_model: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub key_prefix: String,
    pub index_prefix: String,
    pub default_ttl_secs: Option<u64>,
    /// Also keep contexts in an in-memory vector collection.
    pub vector_enabled: bool,
    pub collection_name: String,
    pub embedding_dimension: usize,
    pub cache_ttl_secs: u64,
}

impl StorageConfig {
    pub fn key_value(&self) -> KeyValueStorageConfig {
        KeyValueStorageConfig {
            key_prefix: self.key_prefix.clone(),
            index_prefix: self.index_prefix.clone(),
            default_ttl_secs: self.default_ttl_secs,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            default_ttl_secs: None,
            vector_enabled: true,
            collection_name: "contexts".to_string(),
            embedding_dimension: DEFAULT_HASHING_DIMENSION,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS.unsigned_abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_cached_contexts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cached_contexts: DEFAULT_MAX_CACHED_CONTEXTS,
        }
    }
}
