//! # Context Engine
//!
//! Wires the ctxflow pipeline together:
//!
//! ```text
//! raw content ─► Chunker ─► chunks ─► Composer ─► composed context
//!                   │                     │
//!                   └──────► ContextEngine ◄──── Retriever
//!                              │      ▲
//!                    LRU map ◄─┘      └─► ContextStorage
//! ```
//!
//! A [`ContextEngine`] reports a missing collaborator as
//! [`EngineError::MissingComponent`]. The [`ContextManager`] looks engines
//! up by name and turns the same failures into empty results.
//!
//! ## Example
//!
//! ```no_run
//! use ctxflow_engine::{ContextManager, PipelineConfig};
//! use ctxflow_context::{ChunkOptions, ComposeOptions, ContextType};
//!
//! # async fn example() {
//! let manager = ContextManager::new();
//! manager.create_engine("docs", &PipelineConfig::default()).await;
//!
//! let chunks = manager
//!     .chunk_content("docs", "First.\n\nSecond.", ContextType::Document, &ChunkOptions::new())
//!     .await;
//! let ids: Vec<String> = chunks.iter().map(|c| c.id().to_string()).collect();
//! let summary = manager.compose_context("docs", &ids, &ComposeOptions::new()).await;
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod retriever;

pub use config::{
    ChunkerConfig, ComposerConfig, ComposerStrategy, EngineConfig, PipelineConfig, StorageConfig,
};
pub use engine::ContextEngine;
pub use error::{EngineError, Result};
pub use manager::ContextManager;
pub use retriever::{Retriever, StorageRetriever};
