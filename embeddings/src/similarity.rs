//! Similarity computation for embeddings.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{EmbeddingError, Result};

/// Cosine similarity between two vectors, in `[-1, 1]`.
///
/// A zero-length vector has similarity 0.0 with everything.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = magnitude(a);
    let norm_b = magnitude(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a * norm_b))
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(embedding: &mut [f32]) {
    let norm = magnitude(embedding);
    if norm > 0.0 {
        for x in embedding.iter_mut() {
            *x /= norm;
        }
    }
}

/// A scored match from a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub id: String,
    pub score: f32,
}

/// The `k` candidates most similar to `query`, best first.
///
/// Candidates scoring below `min_score` are dropped. Equal scores keep the
/// candidates' input order.
pub fn find_top_k<'a>(
    query: &[f32],
    candidates: impl IntoIterator<Item = (&'a str, &'a [f32])>,
    k: usize,
    min_score: f32,
) -> Result<Vec<SimilarityResult>> {
    let mut scored: Vec<(OrderedFloat<f32>, &str)> = Vec::new();
    for (id, embedding) in candidates {
        let score = cosine_similarity(query, embedding)?;
        if score >= min_score {
            scored.push((OrderedFloat(score), id));
        }
    }

    // Stable sort so ties stay in insertion order.
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    Ok(scored
        .into_iter()
        .take(k)
        .map(|(score, id)| SimilarityResult {
            id: id.to_string(),
            score: score.0,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cosine_similarity_bounds() {
        let x = [1.0, 0.0, 0.0];
        let y = [0.0, 1.0, 0.0];
        let neg = [-1.0, 0.0, 0.0];

        assert!((cosine_similarity(&x, &x).unwrap() - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&x, &y).unwrap().abs() < 1e-6);
        assert!((cosine_similarity(&x, &neg).unwrap() + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vector_scores_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
    }

    #[test]
    fn test_dimension_mismatch() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn test_normalize() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_find_top_k_keeps_ties_in_order() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let c = [1.0, 0.0];
        let candidates = [("a", &a[..]), ("b", &b[..]), ("c", &c[..])];

        let results = find_top_k(&[1.0, 0.0], candidates, 2, -1.0).unwrap();

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }
}
