//! Similarity index for embedding lookups.

use indexmap::IndexMap;
use tracing::debug;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::{SimilarityResult, find_top_k, normalize};

/// Brute-force cosine index over normalized vectors.
///
/// Entries keep insertion order, so searches with tied scores return the
/// earlier-inserted entry first. Re-inserting an id keeps its position.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    entries: IndexMap<String, Embedding>,
    dimension: usize,
}

impl SimilarityIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace the vector for `id`.
    pub fn upsert(&mut self, id: impl Into<String>, mut embedding: Embedding) -> Result<()> {
        let id = id.into();
        self.check_dimension(&embedding)?;
        normalize(&mut embedding);
        debug!("Indexed embedding: {id}");
        self.entries.insert(id, embedding);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Embedding> {
        self.entries.shift_remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Embedding> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Top `k` entries most similar to `query`.
    pub fn search(&self, query: &[f32], k: usize, min_score: f32) -> Result<Vec<SimilarityResult>> {
        self.search_where(query, k, min_score, |_| true)
    }

    /// Top `k` entries among those whose id passes `keep`.
    pub fn search_where(
        &self,
        query: &[f32],
        k: usize,
        min_score: f32,
        keep: impl Fn(&str) -> bool,
    ) -> Result<Vec<SimilarityResult>> {
        self.check_dimension(query)?;
        let candidates = self
            .entries
            .iter()
            .filter(|(id, _)| keep(id))
            .map(|(id, embedding)| (id.as_str(), embedding.as_slice()));
        find_top_k(query, candidates, k, min_score)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        Ok(())
    }
}
