//! Embedding providers.
//!
//! The vector store calls an [`EmbeddingProvider`] to turn documents and
//! queries into vectors. Model inference lives outside this workspace; the
//! bundled [`HashingProvider`] is a deterministic bag-of-words stand-in
//! good enough for lexical similarity and tests.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use tracing::debug;

use crate::Embedding;
use crate::error::Result;
use crate::similarity::normalize;

/// Dimension used by [`HashingProvider::default`].
pub const DEFAULT_HASHING_DIMENSION: usize = 256;

/// Hook that produces embeddings for text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Length of the vectors this provider returns.
    fn dimension(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Embedding>;

    /// Embed several texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        // Default implementation: process sequentially
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }
}

/// Feature-hashing embedder: every lowercase word bumps one bucket.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
}

impl HashingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, word: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        (hasher.finish() % self.dimension as u64) as usize
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut embedding = vec![0.0f32; self.dimension];
        let mut words = 0usize;
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            embedding[self.bucket(&word.to_lowercase())] += 1.0;
            words += 1;
        }
        normalize(&mut embedding);
        debug!("Hashed {words} words into {} buckets", self.dimension);
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_hashing_is_deterministic_and_case_insensitive() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("Rust async storage").await.unwrap();
        let b = provider.embed("rust ASYNC storage").await.unwrap();

        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_shared_words_score_higher() {
        let provider = HashingProvider::default();
        let query = provider.embed("alpha").await.unwrap();
        let same = provider.embed("alpha alpha").await.unwrap();
        let empty = provider.embed("").await.unwrap();

        assert!((cosine_similarity(&query, &same).unwrap() - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&query, &empty).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_embed_batch() {
        let provider = HashingProvider::new(8);
        let texts = vec!["one".to_string(), "two".to_string()];

        let vectors = provider.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors.len(), 2);
    }
}
