//! Vector-store client interface and an in-memory collection.
//!
//! Records follow the Chroma shape: an id, an indexed document, a flat
//! metadata map restricted to scalar values, and an optional vector.
//! Queries take a scalar `where` clause.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ctxflow_embeddings::{Embedding, EmbeddingProvider, SimilarityIndex};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetadataValue::Int(v) => Some(*v as f64),
            MetadataValue::Float(v) => Some(*v),
            MetadataValue::Bool(_) | MetadataValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn loosely_equals(&self, other: &MetadataValue) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Str(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Str(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Float(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

pub type RecordMetadata = BTreeMap<String, MetadataValue>;

/// One stored (or returned) record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub document: String,
    pub metadata: RecordMetadata,
    /// Caller-supplied vector; `None` lets the collection embed the document.
    pub embedding: Option<Embedding>,
    /// Similarity to the query, set on query results only.
    pub score: Option<f32>,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document: document.into(),
            metadata: RecordMetadata::new(),
            embedding: None,
            score: None,
        }
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_embedding(mut self, embedding: Embedding) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Scalar `where` clause. Comparisons against a missing key never match.
#[derive(Debug, Clone, PartialEq)]
pub enum Where {
    Eq(String, MetadataValue),
    /// Numeric `>=`.
    Gte(String, MetadataValue),
    /// Numeric `<=`.
    Lte(String, MetadataValue),
    And(Vec<Where>),
}

impl Where {
    pub fn eq(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Where::Eq(key.into(), value.into())
    }

    pub fn gte(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Where::Gte(key.into(), value.into())
    }

    pub fn lte(key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        Where::Lte(key.into(), value.into())
    }

    /// Combine clauses; a single clause is returned as-is and none yields `None`.
    pub fn all(mut clauses: Vec<Where>) -> Option<Where> {
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(Where::And(clauses)),
        }
    }

    pub fn matches(&self, metadata: &RecordMetadata) -> bool {
        match self {
            Where::Eq(key, expected) => metadata
                .get(key)
                .is_some_and(|actual| actual.loosely_equals(expected)),
            Where::Gte(key, bound) => compare(metadata.get(key), bound, |a, b| a >= b),
            Where::Lte(key, bound) => compare(metadata.get(key), bound, |a, b| a <= b),
            Where::And(clauses) => clauses.iter().all(|clause| clause.matches(metadata)),
        }
    }
}

fn compare(
    actual: Option<&MetadataValue>,
    bound: &MetadataValue,
    op: fn(f64, f64) -> bool,
) -> bool {
    match (actual.and_then(MetadataValue::as_f64), bound.as_f64()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// The operations the vector backend needs from a collection.
#[async_trait]
pub trait VectorStoreClient: Send + Sync {
    /// Insert or replace records by id.
    async fn add(&self, records: Vec<VectorRecord>) -> ClientResult<()>;

    /// Records for the ids that exist, in request order.
    async fn get(&self, ids: &[String]) -> ClientResult<Vec<VectorRecord>>;

    /// Remove records; returns how many existed.
    async fn delete(&self, ids: &[String]) -> ClientResult<usize>;

    /// Up to `n_results` records most similar to `text`, best first.
    async fn query(
        &self,
        text: &str,
        n_results: usize,
        filter: Option<&Where>,
    ) -> ClientResult<Vec<VectorRecord>>;
}

#[derive(Debug)]
struct CollectionState {
    records: IndexMap<String, VectorRecord>,
    index: SimilarityIndex,
}

/// Process-local collection that embeds through an [`EmbeddingProvider`].
pub struct InMemoryCollection {
    name: String,
    provider: Arc<dyn EmbeddingProvider>,
    state: RwLock<CollectionState>,
    available: AtomicBool,
}

impl InMemoryCollection {
    pub fn new(name: impl Into<String>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let dimension = provider.dimension();
        Self {
            name: name.into(),
            provider,
            state: RwLock::new(CollectionState {
                records: IndexMap::new(),
                index: SimilarityIndex::new(dimension),
            }),
            available: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Simulate the collection going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> ClientResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::Unavailable(format!(
                "collection {} is offline",
                self.name
            )))
        }
    }

    async fn vector_for(&self, record: &VectorRecord) -> ClientResult<Embedding> {
        let embedding = match &record.embedding {
            Some(embedding) => embedding.clone(),
            None => self.provider.embed(&record.document).await?,
        };
        if embedding.len() != self.provider.dimension() {
            return Err(ClientError::InvalidData(format!(
                "record {} has {} dimensions, collection {} expects {}",
                record.id,
                embedding.len(),
                self.name,
                self.provider.dimension()
            )));
        }
        Ok(embedding)
    }
}

#[async_trait]
impl VectorStoreClient for InMemoryCollection {
    async fn add(&self, records: Vec<VectorRecord>) -> ClientResult<()> {
        self.ensure_available()?;

        // Embed before taking the lock so a slow provider does not block readers.
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let vector = self.vector_for(&record).await?;
            prepared.push((record, vector));
        }

        let mut state = self.state.write().await;
        for (mut record, vector) in prepared {
            state
                .index
                .upsert(record.id.clone(), vector)
                .map_err(ClientError::from)?;
            record.score = None;
            state.records.insert(record.id.clone(), record);
        }
        debug!("Collection {} holds {} records", self.name, state.records.len());
        Ok(())
    }

    async fn get(&self, ids: &[String]) -> ClientResult<Vec<VectorRecord>> {
        self.ensure_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.records.get(id).cloned())
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> ClientResult<usize> {
        self.ensure_available()?;
        let mut state = self.state.write().await;
        let mut removed = 0;
        for id in ids {
            if state.records.shift_remove(id).is_some() {
                removed += 1;
            }
            state.index.remove(id);
        }
        Ok(removed)
    }

    async fn query(
        &self,
        text: &str,
        n_results: usize,
        filter: Option<&Where>,
    ) -> ClientResult<Vec<VectorRecord>> {
        self.ensure_available()?;
        let query = self.provider.embed(text).await?;

        let state = self.state.read().await;
        let hits = state.index.search_where(&query, n_results, -1.0, |id| {
            filter.is_none_or(|clause| {
                state
                    .records
                    .get(id)
                    .is_some_and(|record| clause.matches(&record.metadata))
            })
        })?;

        Ok(hits
            .into_iter()
            .filter_map(|hit| {
                state.records.get(&hit.id).map(|record| VectorRecord {
                    score: Some(hit.score),
                    ..record.clone()
                })
            })
            .collect())
    }
}
