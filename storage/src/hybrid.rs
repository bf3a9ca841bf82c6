//! Hybrid backend: a TTL cache over a primary and a vector backend.
//!
//! Writes go to both backends independently and succeed if either one
//! does. There is no rollback, so after a partial failure the backends
//! disagree until the next successful write. Reads try the cache, then
//! the primary, then the vector backend. Searches go to the vector
//! backend when one is configured and never merge results.
//!
//! The cache is swept only when it is written to; there is no background
//! eviction task.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use ctxflow_context::Context;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ContextStorage;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, StorageError};
use crate::filters::SearchFilters;

pub const DEFAULT_CACHE_TTL_SECS: i64 = 300;

#[derive(Debug, Clone)]
struct CacheEntry {
    context: Context,
    stored_at: DateTime<Utc>,
}

pub struct HybridStorage {
    primary: Option<Arc<dyn ContextStorage>>,
    vector: Option<Arc<dyn ContextStorage>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl HybridStorage {
    /// A hybrid storage with no backends; add them with the `with_*` methods.
    pub fn new() -> Self {
        Self {
            primary: None,
            vector: None,
            cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::seconds(DEFAULT_CACHE_TTL_SECS),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_primary(mut self, primary: Arc<dyn ContextStorage>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn with_vector(mut self, vector: Arc<dyn ContextStorage>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    /// Number of cache entries, including ones not yet swept.
    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }

    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        let cleared = cache.len();
        cache.clear();
        info!("Cleared {cleared} cached contexts");
    }

    fn backends(&self) -> impl Iterator<Item = &Arc<dyn ContextStorage>> {
        self.primary.iter().chain(self.vector.iter())
    }

    fn is_fresh(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.stored_at <= self.cache_ttl
    }

    async fn cache_get(&self, id: &str) -> Option<Context> {
        let now = self.clock.now();
        {
            let cache = self.cache.read().await;
            match cache.get(id) {
                Some(entry) if self.is_fresh(entry, now) => return Some(entry.context.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Re-check under the write lock; a writer may have refreshed it.
        let mut cache = self.cache.write().await;
        if cache.get(id).is_some_and(|entry| !self.is_fresh(entry, now)) {
            cache.remove(id);
            debug!("Evicted stale cache entry {id}");
        }
        None
    }

    async fn cache_put(&self, context: &Context) {
        let now = self.clock.now();
        let mut cache = self.cache.write().await;
        cache.retain(|_, entry| self.is_fresh(entry, now));
        cache.insert(
            context.id().to_string(),
            CacheEntry {
                context: context.clone(),
                stored_at: now,
            },
        );
    }

    async fn cache_remove(&self, id: &str) {
        self.cache.write().await.remove(id);
    }

    /// Collapse per-backend outcomes: any success wins, otherwise the most
    /// informative error is returned.
    fn any_succeeded(
        operation: &str,
        outcomes: Vec<(&'static str, Result<()>)>,
    ) -> Result<()> {
        if outcomes.is_empty() {
            return Err(StorageError::NotConfigured("primary or vector backend"));
        }
        let succeeded = outcomes.iter().any(|(_, outcome)| outcome.is_ok());
        let mut first_error = None;
        for (backend, outcome) in outcomes {
            let Err(err) = outcome else {
                continue;
            };
            if succeeded {
                warn!("Hybrid {operation}: {backend} backend failed: {err}");
            } else if first_error
                .as_ref()
                .is_none_or(|kept: &StorageError| kept.is_not_found() && !err.is_not_found())
            {
                first_error = Some(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for HybridStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextStorage for HybridStorage {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    async fn try_store(&self, context: &Context) -> Result<()> {
        let mut outcomes = Vec::new();
        for backend in self.backends() {
            outcomes.push((backend.name(), backend.try_store(context).await));
        }
        Self::any_succeeded("store", outcomes)?;
        self.cache_put(context).await;
        debug!("Stored context {}", context.id());
        Ok(())
    }

    async fn try_retrieve(&self, id: &str) -> Result<Context> {
        if let Some(context) = self.cache_get(id).await {
            debug!("Cache hit for {id}");
            return Ok(context);
        }

        let mut failure = None;
        for backend in self.backends() {
            match backend.try_retrieve(id).await {
                Ok(context) => {
                    debug!("Retrieved {id} from {} backend", backend.name());
                    self.cache_put(&context).await;
                    return Ok(context);
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!("Hybrid retrieve: {} backend failed: {err}", backend.name());
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }

        if self.primary.is_none() && self.vector.is_none() {
            return Err(StorageError::NotConfigured("primary or vector backend"));
        }
        Err(failure.unwrap_or_else(|| StorageError::NotFound(id.to_string())))
    }

    async fn try_update(&self, context: &Context) -> Result<()> {
        let mut outcomes = Vec::new();
        for backend in self.backends() {
            outcomes.push((backend.name(), backend.try_update(context).await));
        }
        Self::any_succeeded("update", outcomes)?;
        self.cache_put(context).await;
        Ok(())
    }

    async fn try_delete(&self, id: &str) -> Result<()> {
        self.cache_remove(id).await;
        let mut outcomes = Vec::new();
        for backend in self.backends() {
            outcomes.push((backend.name(), backend.try_delete(id).await));
        }
        Self::any_succeeded("delete", outcomes)
    }

    async fn try_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>> {
        let backend = self
            .vector
            .as_ref()
            .or(self.primary.as_ref())
            .ok_or(StorageError::NotConfigured("primary or vector backend"))?;
        backend.try_search(query, limit, filters).await
    }
}
