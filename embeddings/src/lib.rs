//! # Embeddings
//!
//! Vector primitives for ctxflow's vector-similarity storage.
//!
//! ## Features
//!
//! - **Embedding hook**: the [`EmbeddingProvider`] trait a vector store calls
//!   to embed documents and queries
//! - **Similarity Search**: cosine similarity and insertion-ordered top-k
//! - **Similarity Index**: a brute-force in-memory vector index

pub mod error;
pub mod index;
pub mod provider;
pub mod similarity;

pub use error::{EmbeddingError, Result};
pub use index::SimilarityIndex;
pub use provider::{EmbeddingProvider, HashingProvider};
pub use similarity::{SimilarityResult, cosine_similarity, find_top_k, normalize};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
