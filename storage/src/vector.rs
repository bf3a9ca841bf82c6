//! Vector-similarity backend.
//!
//! The collection only accepts scalar metadata, so list and map fields
//! (`tags`, `metadata`, `chunks`) travel as JSON strings and tag filters
//! run client-side after the similarity query. To leave room for that,
//! searches fetch `2 * limit` candidates and truncate afterwards. When
//! the tag filter rejects more than half of that batch the search
//! returns fewer than `limit` results even if more matches exist.

use std::sync::Arc;

use async_trait::async_trait;
use ctxflow_context::Context;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::ContextStorage;
use crate::error::{Result, StorageError};
use crate::filters::SearchFilters;
use crate::vector_client::{MetadataValue, RecordMetadata, VectorRecord, VectorStoreClient, Where};

/// Fields stored as JSON-encoded strings.
const JSON_FIELDS: [&str; 3] = ["tags", "metadata", "chunks"];

/// How many candidates to fetch per requested result.
const OVERFETCH_FACTOR: usize = 2;

/// [`ContextStorage`] over a [`VectorStoreClient`].
pub struct VectorStorage {
    client: Arc<dyn VectorStoreClient>,
}

impl VectorStorage {
    pub fn new(client: Arc<dyn VectorStoreClient>) -> Self {
        Self { client }
    }

    fn where_clause(filters: &SearchFilters) -> Option<Where> {
        let mut clauses = Vec::new();
        if let Some(context_type) = filters.context_type {
            clauses.push(Where::eq("context_type", context_type.as_str()));
        }
        if let Some(source) = &filters.source {
            clauses.push(Where::eq("source", source.as_str()));
        }
        if let Some(min_importance) = filters.min_importance {
            clauses.push(Where::gte("importance", min_importance));
        }
        if let Some(max_tokens) = filters.max_tokens {
            clauses.push(Where::lte("tokens", to_i64(max_tokens)));
        }
        Where::all(clauses)
    }
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Flatten a context into a collection record.
pub fn to_record(context: &Context) -> Result<VectorRecord> {
    let mut metadata = RecordMetadata::new();
    metadata.insert("context_type".into(), context.context_type.as_str().into());
    metadata.insert("created_at".into(), context.created_at().to_rfc3339().into());
    metadata.insert("updated_at".into(), context.updated_at().to_rfc3339().into());
    if let Some(expires_at) = context.expires_at {
        metadata.insert("expires_at".into(), expires_at.to_rfc3339().into());
    }
    metadata.insert("importance".into(), context.importance.into());
    metadata.insert("tokens".into(), to_i64(context.tokens()).into());
    if let Some(parent_id) = &context.parent_id {
        metadata.insert("parent_id".into(), parent_id.as_str().into());
    }
    if let Some(source) = &context.source {
        metadata.insert("source".into(), source.as_str().into());
    }
    metadata.insert("tags".into(), serde_json::to_string(&context.tags)?.into());
    metadata.insert("metadata".into(), serde_json::to_string(&context.metadata)?.into());
    metadata.insert("chunks".into(), serde_json::to_string(&context.chunks)?.into());

    Ok(VectorRecord {
        id: context.id().to_string(),
        document: context.content().to_string(),
        metadata,
        embedding: context.embedding.clone(),
        score: None,
    })
}

/// Rebuild a context from a collection record.
pub fn from_record(record: VectorRecord) -> Result<Context> {
    let mut map = Map::new();
    for (key, value) in record.metadata {
        let value = match value {
            MetadataValue::Str(encoded) if JSON_FIELDS.contains(&key.as_str()) => {
                serde_json::from_str(&encoded)?
            }
            MetadataValue::Str(text) => Value::String(text),
            MetadataValue::Bool(flag) => Value::Bool(flag),
            MetadataValue::Int(number) => Value::from(number),
            MetadataValue::Float(number) => Value::from(number),
        };
        map.insert(key, value);
    }
    map.insert("id".into(), Value::String(record.id));
    map.insert("content".into(), Value::String(record.document));
    if let Some(embedding) = record.embedding {
        map.insert("embedding".into(), Value::from(embedding));
    }
    Context::from_value(Value::Object(map)).map_err(StorageError::from)
}

#[async_trait]
impl ContextStorage for VectorStorage {
    fn name(&self) -> &'static str {
        "vector"
    }

    async fn try_store(&self, context: &Context) -> Result<()> {
        self.client.add(vec![to_record(context)?]).await?;
        debug!("Stored context {} in vector collection", context.id());
        Ok(())
    }

    async fn try_retrieve(&self, id: &str) -> Result<Context> {
        let record = self
            .client
            .get(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        from_record(record)
    }

    async fn try_update(&self, context: &Context) -> Result<()> {
        let id = context.id().to_string();
        if self.client.get(std::slice::from_ref(&id)).await?.is_empty() {
            return Err(StorageError::NotFound(id));
        }
        self.client.add(vec![to_record(context)?]).await?;
        debug!("Updated context {id} in vector collection");
        Ok(())
    }

    async fn try_delete(&self, id: &str) -> Result<()> {
        if self.client.delete(&[id.to_string()]).await? == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        debug!("Deleted context {id} from vector collection");
        Ok(())
    }

    async fn try_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let clause = Self::where_clause(filters);
        let fetch = limit.saturating_mul(OVERFETCH_FACTOR);
        let records = self.client.query(query, fetch, clause.as_ref()).await?;
        let fetched = records.len();

        let mut results = Vec::new();
        for record in records {
            let id = record.id.clone();
            match from_record(record) {
                Ok(context) if filters.matches_tags(&context) => results.push(context),
                Ok(_) => {}
                Err(err) => warn!("Skipping undecodable vector record {id}: {err}"),
            }
        }
        results.truncate(limit);
        debug!(
            "Vector search fetched {fetched} records, returning {}",
            results.len()
        );
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector_client::InMemoryCollection;
    use ctxflow_context::ContextType;
    use ctxflow_embeddings::{Embedding, EmbeddingProvider};
    use pretty_assertions::assert_eq;

    /// Two-dimensional embedder: counts of "alpha" and "beta".
    struct KeywordProvider;

    #[async_trait]
    impl EmbeddingProvider for KeywordProvider {
        fn name(&self) -> &str {
            "keyword"
        }

        fn dimension(&self) -> usize {
            2
        }

        async fn embed(&self, text: &str) -> ctxflow_embeddings::Result<Embedding> {
            let count = |word: &str| text.matches(word).count() as f32;
            Ok(vec![count("alpha"), count("beta")])
        }
    }

    fn storage() -> (Arc<InMemoryCollection>, VectorStorage) {
        let collection = Arc::new(InMemoryCollection::new("contexts", Arc::new(KeywordProvider)));
        let storage = VectorStorage::new(collection.clone());
        (collection, storage)
    }

    #[tokio::test]
    async fn test_round_trip_through_scalar_metadata() {
        let (_, storage) = storage();
        let mut ctx = Context::new("alpha document", ContextType::Knowledge)
            .with_id("k1")
            .with_metadata("author", "ann")
            .with_metadata("pages", 3)
            .with_source("wiki")
            .with_parent("root")
            .with_tags(["x", "y"])
            .with_importance(0.75)
            .with_embedding(vec![1.0, 0.0]);
        ctx.add_chunk("k1-0");

        assert!(storage.store_context(&ctx).await);

        assert_eq!(storage.retrieve_context("k1").await, Some(ctx));
    }

    #[tokio::test]
    async fn test_list_fields_are_json_strings() {
        let ctx = Context::new("alpha", ContextType::Text).with_tags(["a", "b"]);

        let record = to_record(&ctx).unwrap();

        assert_eq!(
            record.metadata.get("tags"),
            Some(&MetadataValue::Str("[\"a\",\"b\"]".to_string()))
        );
        assert_eq!(record.metadata.get("source"), None);
    }

    #[tokio::test]
    async fn test_scalar_filters_go_through_where() {
        let (_, storage) = storage();
        let docs = [
            ("code-hi", ContextType::Code, 0.9),
            ("code-lo", ContextType::Code, 0.1),
            ("text-hi", ContextType::Text, 0.9),
        ];
        for (id, context_type, importance) in docs {
            let ctx = Context::new("alpha", context_type)
                .with_id(id)
                .with_importance(importance);
            storage.store_context(&ctx).await;
        }

        let filters = SearchFilters::new()
            .with_context_type(ContextType::Code)
            .with_min_importance(0.5);
        let results = storage.search_contexts("alpha", 5, &filters).await;

        assert_eq!(
            results.iter().map(Context::id).collect::<Vec<_>>(),
            vec!["code-hi"]
        );
    }

    #[tokio::test]
    async fn test_tag_filter_can_return_fewer_than_limit() {
        let (_, storage) = storage();
        for i in 0..4 {
            let mut ctx = Context::new("alpha", ContextType::Text).with_id(format!("alpha-{i}"));
            if i == 0 {
                ctx.add_tag("keep");
            }
            storage.store_context(&ctx).await;
        }
        for i in 0..2 {
            let ctx = Context::new("beta", ContextType::Text)
                .with_id(format!("beta-{i}"))
                .with_tags(["keep"]);
            storage.store_context(&ctx).await;
        }

        // Four alpha records fill the 2x batch; only one of them is tagged,
        // so the tagged beta records are never seen.
        let results = storage
            .search_contexts("alpha", 2, &SearchFilters::new().with_tags(["keep"]))
            .await;

        assert_eq!(
            results.iter().map(Context::id).collect::<Vec<_>>(),
            vec!["alpha-0"]
        );
    }

    #[tokio::test]
    async fn test_missing_and_offline() {
        let (collection, storage) = storage();
        let ctx = Context::new("beta", ContextType::Text).with_id("b");

        assert!(matches!(
            storage.try_update(&ctx).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!storage.delete_context("b").await);

        collection.set_available(false);
        assert!(matches!(
            storage.try_store(&ctx).await,
            Err(StorageError::Backend(_))
        ));
        assert!(storage.search_contexts("beta", 3, &SearchFilters::new()).await.is_empty());
    }
}
