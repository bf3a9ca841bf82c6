//! End-to-end tests for the chunk -> compose -> store pipeline.
//!
//! These tests drive engines built from configuration through the manager
//! and check that:
//! - Python sources are chunked by function and keep their parent link
//! - Hierarchical composition nests chunks under their parent
//! - Tag searches through hybrid storage only return full tag matches
//! - The engine reports missing collaborators and the manager hides them

use std::sync::Arc;

use chrono::{Duration, Utc};
use ctxflow_context::{ChunkOptions, ComposeOptions, Context, ContextType};
use ctxflow_engine::{ContextEngine, ContextManager, EngineError, PipelineConfig};
use ctxflow_storage::{InMemoryKeyValue, KeyValueStorage, SearchFilters};
use pretty_assertions::assert_eq;
use serde_json::Value;

const MODULE: &str = r#"import os

def load(path):
    return open(path).read()

def save(path, data):
    with open(path, "w") as f:
        f.write(data)"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_code_chunks_compose_under_their_parent() {
    init_tracing();
    let config = PipelineConfig::from_toml_str(
        r#"
        [chunker]
        chunk_size = 60
        chunk_overlap = 0

        [composer]
        strategy = "hierarchical"
        "#,
    )
    .unwrap();
    let manager = ContextManager::new();
    manager.create_engine("code", &config).await;

    let module = Context::new(MODULE, ContextType::Code)
        .with_id("module")
        .with_source("io.py");
    manager.add_context("code", module).await.unwrap();

    let options = ChunkOptions::new().with_parent("module").with_source("io.py");
    let chunks = manager
        .chunk_content("code", MODULE, ContextType::Code, &options)
        .await;

    assert!(chunks.len() >= 2);
    for chunk in &chunks {
        assert_eq!(chunk.parent_id.as_deref(), Some("module"));
        assert_eq!(chunk.metadata.get("language"), Some(&Value::from("python")));
        assert_eq!(chunk.metadata.get("strategy"), Some(&Value::from("function")));
    }

    let mut ids = vec!["module".to_string()];
    ids.extend(chunks.iter().map(|c| c.id().to_string()));
    let composed = manager
        .compose_context("code", &ids, &ComposeOptions::new())
        .await
        .unwrap();

    assert!(composed.content().starts_with("import os"));
    assert!(composed.content().lines().any(|line| line == "  def save(path, data):"));
    assert_eq!(composed.metadata.get("root_count"), Some(&Value::from(1)));

    let children = manager.get_chunks("code", composed.id()).await;
    assert_eq!(children.len(), ids.len());
    assert_eq!(
        manager
            .get_parent("code", chunks[0].id())
            .await
            .map(|p| p.id().to_string()),
        Some("module".to_string())
    );
}

#[tokio::test]
async fn test_tag_search_through_hybrid_storage() {
    init_tracing();
    let manager = ContextManager::new();
    manager.create_engine("notes", &PipelineConfig::default()).await;

    for (id, tags) in [("a", vec!["a"]), ("b", vec!["b"]), ("ab", vec!["a", "b"])] {
        let ctx = Context::new(format!("rust notes {id}"), ContextType::Knowledge)
            .with_id(id)
            .with_tags(tags);
        manager.add_context("notes", ctx).await;
    }

    let results = manager
        .search_contexts("notes", "rust", 10, &SearchFilters::new().with_tags(["a", "b"]))
        .await;
    assert_eq!(results.iter().map(Context::id).collect::<Vec<_>>(), vec!["ab"]);

    let retrieved = manager
        .retrieve_context("notes", "rust", 10, &SearchFilters::new().with_tags(["b"]))
        .await;
    let mut retrieved_ids: Vec<&str> = retrieved.iter().map(Context::id).collect();
    retrieved_ids.sort();
    assert_eq!(retrieved_ids, vec!["ab", "b"]);
}

#[tokio::test]
async fn test_engine_errors_but_manager_returns_empty() {
    let manager = ContextManager::new();
    let engine = manager.register_engine(ContextEngine::new("storage-only")).await;

    let err = engine
        .chunk_content("text", ContextType::Text, &ChunkOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingComponent("chunker")));

    assert!(
        manager
            .chunk_content("storage-only", "text", ContextType::Text, &ChunkOptions::new())
            .await
            .is_empty()
    );
}

#[tokio::test]
async fn test_expired_contexts_are_not_searchable() {
    let storage = Arc::new(KeyValueStorage::new(Arc::new(InMemoryKeyValue::new())));
    let engine = ContextEngine::new("ttl").with_storage(storage);
    engine
        .add_context(
            Context::new("stale entry", ContextType::Task)
                .with_id("stale")
                .with_expires_at(Utc::now() - Duration::hours(1)),
        )
        .await;
    engine
        .add_context(Context::new("fresh entry", ContextType::Task).with_id("fresh"))
        .await;

    let results = engine
        .search_contexts("entry", 10, &SearchFilters::new().with_context_type(ContextType::Task))
        .await;

    assert_eq!(results.iter().map(Context::id).collect::<Vec<_>>(), vec!["fresh"]);
}
