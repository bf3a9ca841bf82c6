//! Key-value client interface and an in-memory implementation.
//!
//! The interface mirrors the small Redis command subset the key-value
//! backend needs: plain string values with optional TTL, glob key scans
//! and string sets for secondary indices.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use wildmatch::WildMatch;

use crate::clock::{Clock, SystemClock};
use crate::error::{ClientError, ClientResult};

/// Commands the key-value backend issues.
#[async_trait]
pub trait KeyValueClient: Send + Sync {
    async fn get(&self, key: &str) -> ClientResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> ClientResult<()>;

    /// Set a value that expires after `ttl_secs` seconds.
    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> ClientResult<()>;

    /// Remove a key; returns whether it existed.
    async fn delete(&self, key: &str) -> ClientResult<bool>;

    /// Keys matching a glob pattern (`*`, `?`).
    async fn keys(&self, pattern: &str) -> ClientResult<Vec<String>>;

    /// Add a member to a set; returns whether it was newly added.
    async fn sadd(&self, key: &str, member: &str) -> ClientResult<bool>;

    /// Remove a member from a set; returns whether it was present.
    async fn srem(&self, key: &str, member: &str) -> ClientResult<bool>;

    async fn smembers(&self, key: &str) -> ClientResult<HashSet<String>>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Process-local key-value client.
///
/// Expired values are dropped lazily when read or scanned. It can be
/// switched "offline" to exercise backend-failure paths.
#[derive(Debug)]
pub struct InMemoryKeyValue {
    values: RwLock<HashMap<String, StoredValue>>,
    sets: RwLock<HashMap<String, HashSet<String>>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryKeyValue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            sets: RwLock::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going down (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> ClientResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::Unavailable("in-memory key-value store is offline".to_string()))
        }
    }

    async fn put(&self, key: &str, value: &str, expires_at: Option<DateTime<Utc>>) {
        self.values.write().await.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at,
            },
        );
    }
}

impl Default for InMemoryKeyValue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueClient for InMemoryKeyValue {
    async fn get(&self, key: &str) -> ClientResult<Option<String>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let mut values = self.values.write().await;
        match values.get(key) {
            Some(stored) if stored.expires_at.is_some_and(|at| at <= now) => {
                values.remove(key);
                debug!("Key expired: {key}");
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        self.ensure_available()?;
        self.put(key, value, None).await;
        Ok(())
    }

    async fn setex(&self, key: &str, ttl_secs: u64, value: &str) -> ClientResult<()> {
        self.ensure_available()?;
        // A TTL past the representable time range never expires.
        let expires_at = i64::try_from(ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|ttl| self.clock.now().checked_add_signed(ttl));
        if expires_at.is_none() {
            debug!("TTL of {ttl_secs}s for {key} is out of range; storing without expiry");
        }
        self.put(key, value, expires_at).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> ClientResult<bool> {
        self.ensure_available()?;
        let removed_value = self.values.write().await.remove(key).is_some();
        let removed_set = self.sets.write().await.remove(key).is_some();
        Ok(removed_value || removed_set)
    }

    async fn keys(&self, pattern: &str) -> ClientResult<Vec<String>> {
        self.ensure_available()?;
        let matcher = WildMatch::new(pattern);
        let now = self.clock.now();

        let mut values = self.values.write().await;
        values.retain(|_, stored| stored.expires_at.is_none_or(|at| at > now));
        let mut keys: Vec<String> = values
            .keys()
            .chain(self.sets.read().await.keys())
            .filter(|key| matcher.matches(key))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> ClientResult<bool> {
        self.ensure_available()?;
        Ok(self
            .sets
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> ClientResult<bool> {
        self.ensure_available()?;
        let mut sets = self.sets.write().await;
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> ClientResult<HashSet<String>> {
        self.ensure_available()?;
        Ok(self.sets.read().await.get(key).cloned().unwrap_or_default())
    }
}
