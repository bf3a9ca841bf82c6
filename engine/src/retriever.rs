//! Retrieval collaborators for the engine.

use std::sync::Arc;

use async_trait::async_trait;
use ctxflow_context::Context;
use ctxflow_storage::{ContextStorage, SearchFilters};
use tracing::debug;

use crate::error::Result;

/// Finds contexts relevant to a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn name(&self) -> &'static str;

    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>>;
}

/// Answers queries by searching a storage backend.
pub struct StorageRetriever {
    storage: Arc<dyn ContextStorage>,
}

impl StorageRetriever {
    pub fn new(storage: Arc<dyn ContextStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl Retriever for StorageRetriever {
    fn name(&self) -> &'static str {
        "storage"
    }

    async fn retrieve(
        &self,
        query: &str,
        limit: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<Context>> {
        let contexts = self.storage.try_search(query, limit, filters).await?;
        debug!(
            "Retrieved {} contexts from {} storage",
            contexts.len(),
            self.storage.name()
        );
        Ok(contexts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxflow_context::ContextType;
    use ctxflow_storage::{InMemoryKeyValue, KeyValueStorage};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_storage_retriever_searches_backend() {
        let client = Arc::new(InMemoryKeyValue::new());
        let storage = Arc::new(KeyValueStorage::new(client.clone()));
        let notes = Context::new("tokio runtime notes", ContextType::Knowledge).with_id("k");
        storage.store_context(&notes).await;
        storage
            .store_context(&Context::new("unrelated", ContextType::Knowledge).with_id("u"))
            .await;
        let retriever = StorageRetriever::new(storage);

        let found = retriever
            .retrieve("tokio", 5, &SearchFilters::new())
            .await
            .unwrap();
        assert_eq!(found.iter().map(Context::id).collect::<Vec<_>>(), vec!["k"]);

        client.set_available(false);
        assert!(retriever.retrieve("tokio", 5, &SearchFilters::new()).await.is_err());
    }
}
