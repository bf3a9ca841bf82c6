//! The context engine: one chunker, composer, retriever and storage
//! around a bounded in-memory context map.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::TimeDelta;
use ctxflow_context::{
    ChunkOptions, Chunker, CodeChunker, ComposeOptions, Composer, Context, ContextType,
    HierarchicalComposer, SemanticChunker, SemanticComposer, SequentialComposer, TextChunker,
};
use ctxflow_embeddings::HashingProvider;
use ctxflow_storage::{
    ContextStorage, HybridStorage, InMemoryCollection, InMemoryKeyValue, KeyValueStorage,
    SearchFilters, VectorStorage,
};
use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ComposerStrategy, DEFAULT_MAX_CACHED_CONTEXTS, PipelineConfig};
use crate::error::{EngineError, Result};
use crate::retriever::{Retriever, StorageRetriever};

/// A working unit of the pipeline.
///
/// Contexts added to or loaded by the engine are kept in a least-recently
/// used map; storage, when configured, holds the persistent copy. The two
/// are only synchronized by the methods below.
pub struct ContextEngine {
    name: String,
    contexts: Mutex<LruCache<String, Context>>,
    chunker: Option<Box<dyn Chunker>>,
    composer: Option<Box<dyn Composer>>,
    retriever: Option<Arc<dyn Retriever>>,
    storage: Option<Arc<dyn ContextStorage>>,
}

impl ContextEngine {
    /// An engine with no collaborators.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contexts: Mutex::new(LruCache::new(capacity(DEFAULT_MAX_CACHED_CONTEXTS))),
            chunker: None,
            composer: None,
            retriever: None,
            storage: None,
        }
    }

    /// Build an engine backed by in-memory key-value and vector stores.
    pub fn from_config(name: impl Into<String>, config: &PipelineConfig) -> Self {
        let chunking = &config.chunker;
        let text = TextChunker::new()
            .with_size(chunking.chunk_size, chunking.chunk_overlap)
            .with_strategy(chunking.text_strategy);
        let code = CodeChunker::new()
            .with_size(chunking.chunk_size, chunking.chunk_overlap)
            .with_strategy(chunking.code_strategy)
            .with_language(chunking.language.as_str());
        let mut chunker = SemanticChunker::new()
            .with_text_chunker(text)
            .with_code_chunker(code);
        if let Some(model) = &chunking.embedding_model {
            chunker = chunker.with_embedding_model(model.as_str());
        }

        let composing = &config.composer;
        let composer: Box<dyn Composer> = match composing.strategy {
            ComposerStrategy::Sequential => {
                Box::new(SequentialComposer::new().with_separator(composing.separator.as_str()))
            }
            ComposerStrategy::Hierarchical => Box::new(
                HierarchicalComposer::new()
                    .with_indent(composing.indent_string.as_str())
                    .with_max_depth(composing.max_depth),
            ),
            ComposerStrategy::Semantic => {
                let mut semantic =
                    SemanticComposer::new().with_separator(composing.separator.as_str());
                if let Some(model) = &composing.embedding_model {
                    semantic = semantic.with_embedding_model(model.as_str());
                }
                Box::new(semantic)
            }
        };

        let storing = &config.storage;
        let primary = KeyValueStorage::with_config(
            Arc::new(InMemoryKeyValue::new()),
            storing.key_value(),
        );
        let cache_ttl = i64::try_from(storing.cache_ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX);
        let mut hybrid = HybridStorage::new()
            .with_primary(Arc::new(primary))
            .with_cache_ttl(cache_ttl);
        if storing.vector_enabled {
            let provider = Arc::new(HashingProvider::new(storing.embedding_dimension));
            let collection = InMemoryCollection::new(storing.collection_name.as_str(), provider);
            hybrid = hybrid.with_vector(Arc::new(VectorStorage::new(Arc::new(collection))));
        }
        let storage: Arc<dyn ContextStorage> = Arc::new(hybrid);

        let mut engine = Self::new(name)
            .with_max_cached(config.engine.max_cached_contexts)
            .with_chunker(chunker)
            .with_retriever(Arc::new(StorageRetriever::new(storage.clone())))
            .with_storage(storage);
        engine.composer = Some(composer);
        info!(
            "Built engine {} ({} composer, vector storage {})",
            engine.name,
            composing_name(composing.strategy),
            if storing.vector_enabled { "on" } else { "off" }
        );
        engine
    }

    /// Cap the in-memory map; zero is treated as one.
    pub fn with_max_cached(mut self, max_cached: usize) -> Self {
        self.contexts = Mutex::new(LruCache::new(capacity(max_cached)));
        self
    }

    pub fn with_chunker(mut self, chunker: impl Chunker + 'static) -> Self {
        self.chunker = Some(Box::new(chunker));
        self
    }

    pub fn with_composer(mut self, composer: impl Composer + 'static) -> Self {
        self.composer = Some(Box::new(composer));
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ContextStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn storage(&self) -> Option<&Arc<dyn ContextStorage>> {
        self.storage.as_ref()
    }

    /// Number of contexts currently held in memory.
    pub async fn cached_len(&self) -> usize {
        self.contexts.lock().await.len()
    }

    async fn remember(&self, context: Context) {
        let mut contexts = self.contexts.lock().await;
        let id = context.id().to_string();
        if let Some((evicted, _)) = contexts.push(id.clone(), context) {
            if evicted != id {
                debug!("Engine {} evicted {evicted} from memory", self.name);
            }
        }
    }

    /// Keep `context` in memory and persist it; returns its id.
    pub async fn add_context(&self, context: Context) -> String {
        let id = context.id().to_string();
        if let Some(storage) = &self.storage {
            if !storage.store_context(&context).await {
                warn!("Engine {} could not persist context {id}", self.name);
            }
        }
        self.remember(context).await;
        debug!("Engine {} added context {id}", self.name);
        id
    }

    /// Look in memory first, then in storage. Storage hits are kept in memory.
    pub async fn get_context(&self, id: &str) -> Option<Context> {
        if let Some(context) = self.contexts.lock().await.get(id) {
            return Some(context.clone());
        }
        let context = self.storage.as_ref()?.retrieve_context(id).await?;
        self.remember(context.clone()).await;
        Some(context)
    }

    /// Apply `Context::update` and write the result back.
    pub async fn update_context(
        &self,
        id: &str,
        content: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Option<Context> {
        let mut context = self.get_context(id).await?;
        context.update(content, metadata);
        if let Some(storage) = &self.storage {
            if !storage.update_context(&context).await {
                warn!("Engine {} could not persist update of {id}", self.name);
            }
        }
        self.remember(context.clone()).await;
        Some(context)
    }

    /// Remove from memory and storage; true if either held it.
    pub async fn delete_context(&self, id: &str) -> bool {
        let in_memory = self.contexts.lock().await.pop(id).is_some();
        let in_storage = match &self.storage {
            Some(storage) => storage.delete_context(id).await,
            None => false,
        };
        in_memory || in_storage
    }

    /// Contexts held in memory, most recently used first.
    pub async fn list_contexts(&self) -> Vec<Context> {
        self.contexts
            .lock()
            .await
            .iter()
            .map(|(_, context)| context.clone())
            .collect()
    }

    /// Search storage, or the in-memory map when no storage is configured.
    pub async fn search_contexts(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Vec<Context> {
        if let Some(storage) = &self.storage {
            return storage.search_contexts(query, limit, filters).await;
        }

        let needle = query.trim().to_lowercase();
        let mut matches: Vec<Context> = self
            .contexts
            .lock()
            .await
            .iter()
            .map(|(_, context)| context)
            .filter(|context| !context.is_expired() && filters.matches(context))
            .filter(|context| {
                needle.is_empty() || context.content().to_lowercase().contains(&needle)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.id().cmp(b.id()));
        matches.truncate(limit);
        matches
    }

    /// The context `id` was chunked from, if it and its parent are known.
    pub async fn get_parent(&self, id: &str) -> Option<Context> {
        let parent_id = self.get_context(id).await?.parent_id?;
        self.get_context(&parent_id).await
    }

    /// The known contexts listed in `id`'s chunk list, in list order.
    pub async fn get_chunks(&self, id: &str) -> Vec<Context> {
        let Some(context) = self.get_context(id).await else {
            return Vec::new();
        };
        let mut chunks = Vec::with_capacity(context.chunks.len());
        for chunk_id in &context.chunks {
            match self.get_context(chunk_id).await {
                Some(chunk) => chunks.push(chunk),
                None => debug!("Chunk {chunk_id} of {id} is no longer available"),
            }
        }
        chunks
    }

    /// Split `content` and add every chunk to the engine.
    pub async fn chunk_content(
        &self,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Result<Vec<Context>> {
        let chunker = self
            .chunker
            .as_ref()
            .ok_or(EngineError::MissingComponent("chunker"))?;
        let chunks = chunker.chunk(content, context_type, options)?;
        for chunk in &chunks {
            self.add_context(chunk.clone()).await;
        }
        debug!(
            "Engine {} chunked {} chars into {} contexts",
            self.name,
            content.chars().count(),
            chunks.len()
        );
        Ok(chunks)
    }

    /// Compose the known contexts among `ids` and add the result.
    pub async fn compose_context(
        &self,
        ids: &[String],
        options: &ComposeOptions,
    ) -> Result<Context> {
        let composer = self
            .composer
            .as_ref()
            .ok_or(EngineError::MissingComponent("composer"))?;
        let mut inputs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_context(id).await {
                Some(context) => inputs.push(context),
                None => debug!("Skipping unknown context {id} in composition"),
            }
        }
        let composed = composer.compose(&inputs, options);
        self.add_context(composed.clone()).await;
        Ok(composed)
    }

    /// Ask the retriever and keep what it returns in memory.
    pub async fn retrieve_context(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>> {
        let retriever = self
            .retriever
            .as_ref()
            .ok_or(EngineError::MissingComponent("retriever"))?;
        let contexts = retriever.retrieve(query, limit, filters).await?;
        for context in &contexts {
            self.remember(context.clone()).await;
        }
        Ok(contexts)
    }
}

fn capacity(max: usize) -> NonZeroUsize {
    NonZeroUsize::new(max).unwrap_or(NonZeroUsize::MIN)
}

fn composing_name(strategy: ComposerStrategy) -> &'static str {
    match strategy {
        ComposerStrategy::Sequential => "sequential",
        ComposerStrategy::Hierarchical => "hierarchical",
        ComposerStrategy::Semantic => "semantic",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxflow_context::ChunkStrategy;
    use ctxflow_storage::StorageError;
    use pretty_assertions::assert_eq;

    fn kv_engine(name: &str) -> (Arc<InMemoryKeyValue>, ContextEngine) {
        let client = Arc::new(InMemoryKeyValue::new());
        let storage = Arc::new(KeyValueStorage::new(client.clone()));
        (client, ContextEngine::new(name).with_storage(storage))
    }

    #[tokio::test]
    async fn test_missing_components_are_errors() {
        let engine = ContextEngine::new("bare");

        let chunked = engine
            .chunk_content("text", ContextType::Text, &ChunkOptions::new())
            .await;
        let composed = engine.compose_context(&[], &ComposeOptions::new()).await;
        let retrieved = engine
            .retrieve_context("q", 1, &SearchFilters::new())
            .await;

        assert!(matches!(chunked, Err(EngineError::MissingComponent("chunker"))));
        assert!(matches!(composed, Err(EngineError::MissingComponent("composer"))));
        assert!(matches!(retrieved, Err(EngineError::MissingComponent("retriever"))));
    }

    #[tokio::test]
    async fn test_get_context_falls_back_to_storage_and_caches() {
        let (_, engine) = kv_engine("kv");
        let ctx = Context::new("persisted", ContextType::Text).with_id("p");
        engine.storage().unwrap().store_context(&ctx).await;

        assert_eq!(engine.cached_len().await, 0);
        assert_eq!(engine.get_context("p").await, Some(ctx));
        assert_eq!(engine.cached_len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_serves_reads_when_storage_is_down() {
        let (client, engine) = kv_engine("kv");
        let id = engine
            .add_context(Context::new("kept", ContextType::Text))
            .await;
        client.set_available(false);

        assert_eq!(
            engine.get_context(&id).await.map(|c| c.content().to_string()),
            Some("kept".to_string())
        );
    }

    #[tokio::test]
    async fn test_lru_cap_bounds_memory() {
        let engine = ContextEngine::new("small").with_max_cached(2);
        for id in ["a", "b", "c"] {
            engine
                .add_context(Context::new(id, ContextType::Text).with_id(id))
                .await;
        }

        assert_eq!(engine.cached_len().await, 2);
        assert_eq!(engine.get_context("a").await, None);
        assert_eq!(
            engine
                .list_contexts()
                .await
                .iter()
                .map(Context::id)
                .collect::<Vec<_>>(),
            vec!["c", "b"]
        );
    }

    #[tokio::test]
    async fn test_chunk_content_adds_chunks() {
        let engine = ContextEngine::new("chunks").with_chunker(TextChunker::new());
        let options = ChunkOptions::new()
            .with_size(10)
            .with_overlap(3)
            .with_strategy(ChunkStrategy::Fixed)
            .with_parent("doc");
        engine
            .add_context(Context::new("abcdefghijklmno", ContextType::Text).with_id("doc"))
            .await;

        let chunks = engine
            .chunk_content("abcdefghijklmno", ContextType::Text, &options)
            .await
            .unwrap();

        assert_eq!(
            chunks.iter().map(Context::content).collect::<Vec<_>>(),
            vec!["abcdefghij", "hijklmno"]
        );
        assert_eq!(engine.cached_len().await, 3);
        assert_eq!(
            engine.get_parent(chunks[1].id()).await.map(|p| p.id().to_string()),
            Some("doc".to_string())
        );
    }

    #[tokio::test]
    async fn test_compose_context_resolves_ids_and_chunks() {
        let engine = ContextEngine::new("compose").with_composer(SequentialComposer::new());
        let a = engine
            .add_context(Context::new("first", ContextType::Text))
            .await;
        let b = engine
            .add_context(Context::new("second", ContextType::Text))
            .await;

        let composed = engine
            .compose_context(
                &[a.clone(), "missing".to_string(), b.clone()],
                &ComposeOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(composed.content(), "first\n\nsecond");
        assert_eq!(composed.chunks, vec![a, b]);
        assert_eq!(
            engine
                .get_chunks(composed.id())
                .await
                .iter()
                .map(Context::content)
                .collect::<Vec<_>>(),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (_, engine) = kv_engine("kv");
        let id = engine
            .add_context(Context::new("v1", ContextType::Text))
            .await;

        let updated = engine
            .update_context(&id, Some("version two"), None)
            .await
            .unwrap();
        assert_eq!(updated.tokens(), 2);
        assert_eq!(
            engine
                .storage()
                .unwrap()
                .retrieve_context(&id)
                .await
                .map(|c| c.content().to_string()),
            Some("version two".to_string())
        );

        assert!(engine.delete_context(&id).await);
        assert_eq!(engine.get_context(&id).await, None);
        assert!(!engine.delete_context(&id).await);
        assert_eq!(engine.update_context(&id, Some("x"), None).await, None);
    }

    #[tokio::test]
    async fn test_search_without_storage_filters_memory() {
        let engine = ContextEngine::new("memory");
        engine
            .add_context(
                Context::new("Tokio tasks", ContextType::Knowledge)
                    .with_id("k1")
                    .with_tags(["rust"]),
            )
            .await;
        engine
            .add_context(Context::new("tokio timers", ContextType::Knowledge).with_id("k2"))
            .await;

        let results = engine
            .search_contexts("tokio", 10, &SearchFilters::new().with_tags(["rust"]))
            .await;

        assert_eq!(results.iter().map(Context::id).collect::<Vec<_>>(), vec!["k1"]);
    }

    #[tokio::test]
    async fn test_retrieval_errors_propagate() {
        let (client, engine) = kv_engine("kv");
        let storage = engine.storage().cloned().unwrap();
        let engine = engine.with_retriever(Arc::new(StorageRetriever::new(storage)));
        client.set_available(false);

        let err = engine
            .retrieve_context("q", 3, &SearchFilters::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Storage(StorageError::Backend(_))));
    }

    #[tokio::test]
    async fn test_from_config_wires_everything() {
        let engine = ContextEngine::from_config("configured", &PipelineConfig::default());
        let text = "First paragraph.\n\nSecond paragraph.";

        let chunks = engine
            .chunk_content(
                text,
                ContextType::Document,
                &ChunkOptions::new().with_size(20).with_overlap(0),
            )
            .await
            .unwrap();
        assert_eq!(chunks.len(), 2);

        let ids: Vec<String> = chunks.iter().map(|c| c.id().to_string()).collect();
        let composed = engine
            .compose_context(&ids, &ComposeOptions::new())
            .await
            .unwrap();
        assert_eq!(composed.content(), text);

        let found = engine
            .retrieve_context("second paragraph", 1, &SearchFilters::new())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_accepts_unbounded_cache_ttl() {
        let mut config = PipelineConfig::default();
        config.storage.cache_ttl_secs = u64::MAX;
        let engine = ContextEngine::from_config("forever", &config);
        let id = engine
            .add_context(Context::new("kept", ContextType::Text).with_id("k"))
            .await;

        assert_eq!(
            engine.get_context(&id).await.map(|c| c.content().to_string()),
            Some("kept".to_string())
        );
        let storage = engine.storage().unwrap();
        assert!(storage.retrieve_context("k").await.is_some());
    }
}
