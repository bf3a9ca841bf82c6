//! Named registry of context engines.
//!
//! Every pass-through returns `None` or an empty list when the engine is
//! unknown or the engine call fails; the error is logged, not returned.
//! Callers who need the error should talk to the engine directly.

use std::collections::HashMap;
use std::sync::Arc;

use ctxflow_context::{ChunkOptions, ComposeOptions, Context, ContextType};
use ctxflow_storage::SearchFilters;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::engine::ContextEngine;
use crate::error::EngineError;

#[derive(Default)]
pub struct ContextManager {
    engines: RwLock<HashMap<String, Arc<ContextEngine>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `engine` under its name, replacing any engine of that name.
    pub async fn register_engine(&self, engine: ContextEngine) -> Arc<ContextEngine> {
        let engine = Arc::new(engine);
        let name = engine.name().to_string();
        if self
            .engines
            .write()
            .await
            .insert(name.clone(), engine.clone())
            .is_some()
        {
            info!("Replaced engine {name}");
        } else {
            info!("Registered engine {name}");
        }
        engine
    }

    /// Build an engine from `config` and register it.
    pub async fn create_engine(&self, name: &str, config: &PipelineConfig) -> Arc<ContextEngine> {
        self.register_engine(ContextEngine::from_config(name, config))
            .await
    }

    pub async fn remove_engine(&self, name: &str) -> bool {
        let removed = self.engines.write().await.remove(name).is_some();
        if removed {
            info!("Removed engine {name}");
        }
        removed
    }

    pub async fn engine(&self, name: &str) -> Option<Arc<ContextEngine>> {
        let engine = self.engines.read().await.get(name).cloned();
        if engine.is_none() {
            debug!("No engine named {name}");
        }
        engine
    }

    /// Registered engine names, sorted.
    pub async fn engine_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.engines.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn add_context(&self, engine: &str, context: Context) -> Option<String> {
        Some(self.engine(engine).await?.add_context(context).await)
    }

    pub async fn get_context(&self, engine: &str, id: &str) -> Option<Context> {
        self.engine(engine).await?.get_context(id).await
    }

    pub async fn update_context(
        &self,
        engine: &str,
        id: &str,
        content: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Option<Context> {
        self.engine(engine)
            .await?
            .update_context(id, content, metadata)
            .await
    }

    pub async fn delete_context(&self, engine: &str, id: &str) -> bool {
        match self.engine(engine).await {
            Some(found) => found.delete_context(id).await,
            None => false,
        }
    }

    pub async fn list_contexts(&self, engine: &str) -> Vec<Context> {
        match self.engine(engine).await {
            Some(found) => found.list_contexts().await,
            None => Vec::new(),
        }
    }

    pub async fn search_contexts(
        &self,
        engine: &str,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Vec<Context> {
        match self.engine(engine).await {
            Some(found) => found.search_contexts(query, limit, filters).await,
            None => Vec::new(),
        }
    }

    pub async fn get_parent(&self, engine: &str, id: &str) -> Option<Context> {
        self.engine(engine).await?.get_parent(id).await
    }

    pub async fn get_chunks(&self, engine: &str, id: &str) -> Vec<Context> {
        match self.engine(engine).await {
            Some(found) => found.get_chunks(id).await,
            None => Vec::new(),
        }
    }

    pub async fn chunk_content(
        &self,
        engine: &str,
        content: &str,
        context_type: ContextType,
        options: &ChunkOptions,
    ) -> Vec<Context> {
        let Some(found) = self.engine(engine).await else {
            return Vec::new();
        };
        let chunked = found.chunk_content(content, context_type, options).await;
        swallow(engine, "chunk_content", chunked).unwrap_or_default()
    }

    pub async fn compose_context(
        &self,
        engine: &str,
        ids: &[String],
        options: &ComposeOptions,
    ) -> Option<Context> {
        let found = self.engine(engine).await?;
        let composed = found.compose_context(ids, options).await;
        swallow(engine, "compose_context", composed)
    }

    pub async fn retrieve_context(
        &self,
        engine: &str,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Vec<Context> {
        let Some(found) = self.engine(engine).await else {
            return Vec::new();
        };
        let retrieved = found.retrieve_context(query, limit, filters).await;
        swallow(engine, "retrieve_context", retrieved).unwrap_or_default()
    }
}

fn swallow<T>(engine: &str, operation: &str, result: Result<T, EngineError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) if err.is_missing_component() => {
            debug!("Engine {engine} {operation}: {err}");
            None
        }
        Err(err) => {
            warn!("Engine {engine} {operation} failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxflow_context::{SequentialComposer, TextChunker};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_registry() {
        let manager = ContextManager::new();
        manager.register_engine(ContextEngine::new("b")).await;
        manager.create_engine("a", &PipelineConfig::default()).await;

        assert_eq!(manager.engine_names().await, vec!["a".to_string(), "b".to_string()]);
        assert!(manager.remove_engine("b").await);
        assert!(!manager.remove_engine("b").await);
        assert!(manager.engine("b").await.is_none());
    }

    #[tokio::test]
    async fn test_missing_components_are_swallowed() {
        let manager = ContextManager::new();
        manager.register_engine(ContextEngine::new("bare")).await;

        assert!(
            manager
                .chunk_content("bare", "text", ContextType::Text, &ChunkOptions::new())
                .await
                .is_empty()
        );
        assert_eq!(
            manager.compose_context("bare", &[], &ComposeOptions::new()).await,
            None
        );
        assert!(
            manager
                .retrieve_context("bare", "q", 3, &SearchFilters::new())
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_unknown_engine_is_empty() {
        let manager = ContextManager::new();
        let ctx = Context::new("x", ContextType::Text);

        assert_eq!(manager.add_context("nope", ctx).await, None);
        assert_eq!(manager.get_context("nope", "x").await, None);
        assert!(!manager.delete_context("nope", "x").await);
        assert!(manager.list_contexts("nope").await.is_empty());
    }

    #[tokio::test]
    async fn test_pass_throughs_reach_engine() {
        let manager = ContextManager::new();
        let engine = ContextEngine::new("work")
            .with_chunker(TextChunker::new())
            .with_composer(SequentialComposer::new());
        manager.register_engine(engine).await;

        let chunks = manager
            .chunk_content(
                "work",
                "one\n\ntwo",
                ContextType::Text,
                &ChunkOptions::new().with_size(4).with_overlap(0),
            )
            .await;
        assert_eq!(chunks.len(), 2);

        let ids: Vec<String> = chunks.iter().map(|c| c.id().to_string()).collect();
        let composed = manager
            .compose_context("work", &ids, &ComposeOptions::new())
            .await
            .unwrap();
        assert_eq!(composed.content(), "one\n\ntwo");

        let updated = manager
            .update_context("work", &ids[0], Some("uno"), None)
            .await
            .unwrap();
        assert_eq!(updated.content(), "uno");
        assert_eq!(
            manager
                .get_chunks("work", composed.id())
                .await
                .iter()
                .map(Context::content)
                .collect::<Vec<_>>(),
            vec!["uno", "two"]
        );
    }
}
