//! # Contexts
//!
//! The value model and the content transforms of the ctxflow pipeline:
//!
//! - **Context**: content plus retrieval metadata, the unit every stage passes on
//! - **Chunkers**: split raw text or code into ordered chunk contexts
//! - **Composers**: merge several contexts into one composed context
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  raw content ──► Chunker ──► [Context, ...] ──► Composer        │
//! │                   │                                │            │
//! │         Text / Code / Semantic     Sequential / Hierarchical /  │
//! │                                           Semantic              │
//! │                                             ▼                   │
//! │                                          Context                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod chunker;
pub mod composer;
pub mod context;
pub mod error;

pub use chunker::{
    ChunkOptions, ChunkStrategy, Chunker, CodeChunker, SemanticChunker, TextChunker,
    fixed_size_split,
};
pub use composer::{
    ComposeOptions, Composer, HierarchicalComposer, SemanticComposer, SequentialComposer,
};
pub use context::{Context, ContextType, estimate_tokens};
pub use error::{ContextError, Result};
