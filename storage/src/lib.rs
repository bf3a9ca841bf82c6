//! # Storage
//!
//! Persistence backends for ctxflow contexts.
//!
//! ```text
//!                    ┌──────────────────┐
//!  store/retrieve ─▶ │  HybridStorage   │ ── TTL cache (id -> context)
//!                    └───┬──────────┬───┘
//!                        │          │
//!              ┌─────────▼───┐  ┌───▼───────────┐
//!              │ KeyValue    │  │ Vector        │
//!              │ + indices   │  │ + scalar where│
//!              └─────────────┘  └───────────────┘
//! ```
//!
//! Every backend implements [`ContextStorage`]. The `try_*` methods report
//! [`StorageError`] kinds; the plain methods keep the forgiving
//! bool/option/list shape and log whatever they swallow.

pub mod clock;
pub mod error;
pub mod filters;
pub mod hybrid;
pub mod kv;
pub mod kv_client;
pub mod vector;
pub mod vector_client;

use async_trait::async_trait;
use ctxflow_context::Context;
use tracing::{debug, warn};

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClientError, ClientResult, Result, StorageError};
pub use filters::SearchFilters;
pub use hybrid::HybridStorage;
pub use kv::{KeyValueStorage, KeyValueStorageConfig};
pub use kv_client::{InMemoryKeyValue, KeyValueClient};
pub use vector::VectorStorage;
pub use vector_client::{
    InMemoryCollection, MetadataValue, RecordMetadata, VectorRecord, VectorStoreClient, Where,
};

/// A place contexts can be persisted to and searched in.
#[async_trait]
pub trait ContextStorage: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    async fn try_store(&self, context: &Context) -> Result<()>;

    async fn try_retrieve(&self, id: &str) -> Result<Context>;

    /// Replace a context that already exists.
    async fn try_update(&self, context: &Context) -> Result<()>;

    async fn try_delete(&self, id: &str) -> Result<()>;

    /// Up to `limit` contexts matching `query` and `filters`.
    async fn try_search(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>>;

    async fn store_context(&self, context: &Context) -> bool {
        match self.try_store(context).await {
            Ok(()) => true,
            Err(err) => {
                log_swallowed(self.name(), "store", &err);
                false
            }
        }
    }

    async fn retrieve_context(&self, id: &str) -> Option<Context> {
        match self.try_retrieve(id).await {
            Ok(context) => Some(context),
            Err(err) => {
                log_swallowed(self.name(), "retrieve", &err);
                None
            }
        }
    }

    async fn update_context(&self, context: &Context) -> bool {
        match self.try_update(context).await {
            Ok(()) => true,
            Err(err) => {
                log_swallowed(self.name(), "update", &err);
                false
            }
        }
    }

    async fn delete_context(&self, id: &str) -> bool {
        match self.try_delete(id).await {
            Ok(()) => true,
            Err(err) => {
                log_swallowed(self.name(), "delete", &err);
                false
            }
        }
    }

    async fn search_contexts(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Vec<Context> {
        match self.try_search(query, limit, filters).await {
            Ok(contexts) => contexts,
            Err(err) => {
                log_swallowed(self.name(), "search", &err);
                Vec::new()
            }
        }
    }
}

fn log_swallowed(backend: &str, operation: &str, err: &StorageError) {
    if err.is_not_found() {
        debug!("{backend} {operation}: {err}");
    } else {
        warn!("{backend} {operation} failed: {err}");
    }
}
