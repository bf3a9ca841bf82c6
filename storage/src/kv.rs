//! Key-value backend with secondary indices.
//!
//! Layout:
//!
//! - `{key_prefix}{id}` holds the context as JSON
//! - `{index_prefix}type:{context_type}`, `{index_prefix}source:{source}` and
//!   `{index_prefix}tag:{tag}` are sets of context ids
//!
//! Filtered searches intersect the index sets, unfiltered ones scan keys.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use ctxflow_context::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ContextStorage;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StorageError};
use crate::filters::SearchFilters;
use crate::kv_client::KeyValueClient;

pub const DEFAULT_KEY_PREFIX: &str = "context:";
pub const DEFAULT_INDEX_PREFIX: &str = "context_index:";

/// Key layout and expiry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyValueStorageConfig {
    pub key_prefix: String,
    pub index_prefix: String,
    /// TTL for contexts without an `expires_at`. `None` keeps them forever.
    pub default_ttl_secs: Option<u64>,
}

impl Default for KeyValueStorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            index_prefix: DEFAULT_INDEX_PREFIX.to_string(),
            default_ttl_secs: None,
        }
    }
}

/// [`ContextStorage`] over a [`KeyValueClient`].
pub struct KeyValueStorage {
    client: Arc<dyn KeyValueClient>,
    config: KeyValueStorageConfig,
    clock: Arc<dyn Clock>,
}

impl KeyValueStorage {
    pub fn new(client: Arc<dyn KeyValueClient>) -> Self {
        Self::with_config(client, KeyValueStorageConfig::default())
    }

    pub fn with_config(client: Arc<dyn KeyValueClient>, config: KeyValueStorageConfig) -> Self {
        Self {
            client,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` when deriving TTLs and skipping expired contexts.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &KeyValueStorageConfig {
        &self.config
    }

    fn data_key(&self, id: &str) -> String {
        format!("{}{id}", self.config.key_prefix)
    }

    fn type_index(&self, context_type: &str) -> String {
        format!("{}type:{context_type}", self.config.index_prefix)
    }

    fn source_index(&self, source: &str) -> String {
        format!("{}source:{source}", self.config.index_prefix)
    }

    fn tag_index(&self, tag: &str) -> String {
        format!("{}tag:{tag}", self.config.index_prefix)
    }

    /// Every index set `context` belongs to.
    fn index_keys(&self, context: &Context) -> Vec<String> {
        let mut keys = vec![self.type_index(context.context_type.as_str())];
        if let Some(source) = &context.source {
            keys.push(self.source_index(source));
        }
        keys.extend(context.tags.iter().map(|tag| self.tag_index(tag)));
        keys
    }

    /// Index sets a filtered search has to intersect.
    fn filter_index_keys(&self, filters: &SearchFilters) -> Vec<String> {
        let mut keys = Vec::new();
        if let Some(context_type) = filters.context_type {
            keys.push(self.type_index(context_type.as_str()));
        }
        if let Some(source) = &filters.source {
            keys.push(self.source_index(source));
        }
        keys.extend(filters.tags.iter().map(|tag| self.tag_index(tag)));
        keys
    }

    /// TTL in seconds for `context`, if it should expire at all.
    fn ttl_secs(&self, context: &Context) -> Option<u64> {
        match context.expires_at {
            Some(expires_at) => {
                let remaining = (expires_at - self.clock.now()).num_seconds().max(1);
                Some(u64::try_from(remaining).unwrap_or(1))
            }
            None => self.config.default_ttl_secs,
        }
    }

    async fn load(&self, id: &str) -> Result<Option<Context>> {
        match self.client.get(&self.data_key(id)).await? {
            Some(json) => Ok(Some(Context::from_json(&json)?)),
            None => Ok(None),
        }
    }

    async fn add_to_indices(&self, context: &Context) -> Result<()> {
        for key in self.index_keys(context) {
            self.client.sadd(&key, context.id()).await?;
        }
        Ok(())
    }

    async fn remove_from_indices(&self, context: &Context) -> Result<()> {
        for key in self.index_keys(context) {
            self.client.srem(&key, context.id()).await?;
        }
        Ok(())
    }

    async fn write(&self, context: &Context) -> Result<()> {
        // Index entries of the previous version would otherwise go stale.
        match self.load(context.id()).await {
            Ok(Some(previous)) => self.remove_from_indices(&previous).await?,
            Ok(None) => {}
            Err(StorageError::Encoding(err)) => {
                warn!("Overwriting undecodable context {}: {err}", context.id());
            }
            Err(err) => return Err(err),
        }

        let key = self.data_key(context.id());
        let json = context.to_json()?;
        match self.ttl_secs(context) {
            Some(ttl) => self.client.setex(&key, ttl, &json).await?,
            None => self.client.set(&key, &json).await?,
        }
        self.add_to_indices(context).await
    }

    async fn candidate_ids(&self, filters: &SearchFilters) -> Result<Vec<String>> {
        let mut ids: Vec<String> = if filters.has_index_filters() {
            let mut intersection: Option<HashSet<String>> = None;
            for key in self.filter_index_keys(filters) {
                let members = self.client.smembers(&key).await?;
                let next = match intersection {
                    Some(current) => current.intersection(&members).cloned().collect(),
                    None => members,
                };
                if next.is_empty() {
                    return Ok(Vec::new());
                }
                intersection = Some(next);
            }
            intersection.unwrap_or_default().into_iter().collect()
        } else {
            let prefix = &self.config.key_prefix;
            self.client
                .keys(&format!("{prefix}*"))
                .await?
                .into_iter()
                .filter_map(|key| key.strip_prefix(prefix.as_str()).map(str::to_string))
                .collect()
        };
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl ContextStorage for KeyValueStorage {
    fn name(&self) -> &'static str {
        "key-value"
    }

    async fn try_store(&self, context: &Context) -> Result<()> {
        self.write(context).await?;
        debug!("Stored context {}", context.id());
        Ok(())
    }

    async fn try_retrieve(&self, id: &str) -> Result<Context> {
        self.load(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn try_update(&self, context: &Context) -> Result<()> {
        if self.client.get(&self.data_key(context.id())).await?.is_none() {
            return Err(StorageError::NotFound(context.id().to_string()));
        }
        self.write(context).await?;
        debug!("Updated context {}", context.id());
        Ok(())
    }

    async fn try_delete(&self, id: &str) -> Result<()> {
        let previous = match self.load(id).await {
            Ok(Some(previous)) => Some(previous),
            Ok(None) => return Err(StorageError::NotFound(id.to_string())),
            Err(StorageError::Encoding(err)) => {
                warn!("Deleting undecodable context {id}: {err}");
                None
            }
            Err(err) => return Err(err),
        };
        if let Some(previous) = &previous {
            self.remove_from_indices(previous).await?;
        }
        self.client.delete(&self.data_key(id)).await?;
        debug!("Deleted context {id}");
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

        let now = self.clock.now();
        let needle = query.trim().to_lowercase();
        let mut results = Vec::new();
        for id in self.candidate_ids(filters).await? {
            let context = match self.load(&id).await {
                Ok(Some(context)) => context,
                // Index member whose data key already expired.
                Ok(None) => continue,
                Err(StorageError::Encoding(err)) => {
                    warn!("Skipping undecodable context {id}: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if context.is_expired_at(now) || !filters.matches(&context) {
                continue;
            }
            if !needle.is_empty() && !context.content().to_lowercase().contains(&needle) {
                continue;
            }
            results.push(context);
            if results.len() >= limit {
                break;
            }
        }
        debug!("Key-value search returned {} contexts", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ClientError;
    use crate::kv_client::InMemoryKeyValue;
    use chrono::Duration;
    use ctxflow_context::ContextType;
    use pretty_assertions::assert_eq;

    fn storage() -> (Arc<InMemoryKeyValue>, KeyValueStorage) {
        let client = Arc::new(InMemoryKeyValue::new());
        let storage = KeyValueStorage::new(client.clone());
        (client, storage)
    }

    fn ids(contexts: &[Context]) -> Vec<&str> {
        contexts.iter().map(Context::id).collect()
    }

    #[tokio::test]
    async fn test_store_and_retrieve() {
        let (_, storage) = storage();
        let ctx = Context::new("hello world", ContextType::Document)
            .with_id("doc-1")
            .with_source("notes.md")
            .with_tags(["a"]);

        assert!(storage.store_context(&ctx).await);

        assert_eq!(storage.retrieve_context("doc-1").await, Some(ctx));
        assert_eq!(storage.retrieve_context("missing").await, None);
    }

    #[tokio::test]
    async fn test_search_intersects_tag_indices() {
        let (_, storage) = storage();
        for (id, tags) in [("only-a", vec!["a"]), ("only-b", vec!["b"]), ("both", vec!["a", "b"])] {
            let ctx = Context::new(id, ContextType::Text).with_id(id).with_tags(tags);
            assert!(storage.store_context(&ctx).await);
        }

        let results = storage
            .search_contexts("", 10, &SearchFilters::new().with_tags(["a", "b"]))
            .await;

        assert_eq!(ids(&results), vec!["both"]);
    }

    #[tokio::test]
    async fn test_search_without_filters_scans_keys() {
        let (_, storage) = storage();
        for id in ["c", "a", "b"] {
            let ctx = Context::new(format!("content {id}"), ContextType::Text).with_id(id);
            storage.store_context(&ctx).await;
        }

        let results = storage.search_contexts("", 2, &SearchFilters::new()).await;

        assert_eq!(ids(&results), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_search_post_filters_and_query() {
        let (_, storage) = storage();
        let low = Context::new("Rust storage notes", ContextType::Code)
            .with_id("low")
            .with_importance(0.2);
        let high = Context::new("rust storage internals", ContextType::Code)
            .with_id("high")
            .with_importance(0.9);
        let other = Context::new("python notes", ContextType::Code)
            .with_id("other")
            .with_importance(0.9);
        for ctx in [&low, &high, &other] {
            storage.store_context(ctx).await;
        }

        let filters = SearchFilters::new()
            .with_context_type(ContextType::Code)
            .with_min_importance(0.5);
        let results = storage.search_contexts("RUST", 10, &filters).await;

        assert_eq!(ids(&results), vec!["high"]);
    }

    #[tokio::test]
    async fn test_restore_moves_index_membership() {
        let (client, storage) = storage();
        let mut ctx = Context::new("body", ContextType::Text)
            .with_id("x")
            .with_source("old.md")
            .with_tags(["draft"]);
        storage.store_context(&ctx).await;

        ctx.remove_tag("draft");
        ctx.add_tag("final");
        ctx.source = Some("new.md".to_string());
        assert!(storage.update_context(&ctx).await);

        assert!(client.smembers("context_index:tag:draft").await.unwrap().is_empty());
        assert!(client.smembers("context_index:source:old.md").await.unwrap().is_empty());
        let results = storage
            .search_contexts("", 10, &SearchFilters::new().with_source("new.md"))
            .await;
        assert_eq!(ids(&results), vec!["x"]);
    }

    #[tokio::test]
    async fn test_update_and_delete_missing_are_not_found() {
        let (_, storage) = storage();
        let ctx = Context::new("ghost", ContextType::Text).with_id("ghost");

        assert!(matches!(
            storage.try_update(&ctx).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.try_delete("ghost").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(!storage.update_context(&ctx).await);
        assert!(!storage.delete_context("ghost").await);
    }

    #[tokio::test]
    async fn test_delete_clears_indices() {
        let (client, storage) = storage();
        let ctx = Context::new("body", ContextType::Task)
            .with_id("t1")
            .with_tags(["todo"]);
        storage.store_context(&ctx).await;

        assert!(storage.delete_context("t1").await);

        assert_eq!(storage.retrieve_context("t1").await, None);
        assert!(client.smembers("context_index:tag:todo").await.unwrap().is_empty());
        assert!(client.smembers("context_index:type:task").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expires_at_sets_key_ttl() {
        let clock = Arc::new(ManualClock::starting_now());
        let client = Arc::new(InMemoryKeyValue::with_clock(clock.clone()));
        let storage = KeyValueStorage::new(client).with_clock(clock.clone());
        let ctx = Context::new("short lived", ContextType::Text)
            .with_id("tmp")
            .with_tags(["t"])
            .with_expires_at(clock.now() + Duration::seconds(30));
        storage.store_context(&ctx).await;

        clock.advance(Duration::seconds(31));

        assert_eq!(storage.retrieve_context("tmp").await, None);
        assert!(
            storage
                .search_contexts("", 10, &SearchFilters::new().with_tags(["t"]))
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_default_ttl_applies_without_expiry() {
        let clock = Arc::new(ManualClock::starting_now());
        let client = Arc::new(InMemoryKeyValue::with_clock(clock.clone()));
        let config = KeyValueStorageConfig {
            default_ttl_secs: Some(60),
            ..Default::default()
        };
        let storage = KeyValueStorage::with_config(client, config).with_clock(clock.clone());
        storage
            .store_context(&Context::new("cached", ContextType::Text).with_id("c"))
            .await;

        clock.advance(Duration::seconds(59));
        assert!(storage.retrieve_context("c").await.is_some());
        clock.advance(Duration::seconds(2));
        assert!(storage.retrieve_context("c").await.is_none());
    }

    #[tokio::test]
    async fn test_huge_default_ttl_stores_without_expiry() {
        let client = Arc::new(InMemoryKeyValue::new());
        let config = KeyValueStorageConfig {
            default_ttl_secs: Some(10_000_000_000_000),
            ..Default::default()
        };
        let storage = KeyValueStorage::with_config(client, config);
        let ctx = Context::new("long lived", ContextType::Text).with_id("long");

        assert!(storage.store_context(&ctx).await);
        assert_eq!(
            storage
                .retrieve_context("long")
                .await
                .map(|found| found.content().to_string()),
            Some("long lived".to_string())
        );
    }

    #[tokio::test]
    async fn test_backend_failure_is_distinguished_but_collapsed() {
        let (client, storage) = storage();
        let ctx = Context::new("body", ContextType::Text).with_id("x");
        client.set_available(false);

        assert!(matches!(
            storage.try_retrieve("x").await,
            Err(StorageError::Backend(ClientError::Unavailable(_)))
        ));
        assert!(!storage.store_context(&ctx).await);
        assert!(storage.search_contexts("", 5, &SearchFilters::new()).await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_record_is_encoding_error() {
        let (client, storage) = storage();
        client.set("context:bad", "not json").await.unwrap();

        assert!(matches!(
            storage.try_retrieve("bad").await,
            Err(StorageError::Encoding(_))
        ));
        assert!(storage.search_contexts("", 5, &SearchFilters::new()).await.is_empty());
    }
}
