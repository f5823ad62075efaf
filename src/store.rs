use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::util::Clock;

/// Contract of the external key-value store backing the response cache:
/// get / set-with-TTL / delete, plus set-if-absent to narrow negative-cache
/// races between replicas.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns true if the write happened. Stores without a native primitive
    /// fall back to get-then-set, which is racy across replicas but safe: the
    /// loser's value is equivalent.
    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.set_ttl(key, value, ttl).await?;
        Ok(true)
    }
}

#[derive(Debug)]
struct StoredValue {
    value: String,
    expires_at_ms: u64,
}

/// In-process store for single-replica deployments and tests. Expiry is lazy;
/// a bounded entry count evicts the nearest-to-expiry entry first.
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    max_entries: usize,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            clock,
        }
    }

    fn evict_if_full(entries: &mut HashMap<String, StoredValue>, max_entries: usize) {
        while entries.len() >= max_entries {
            let Some(key) = entries
                .iter()
                .min_by_key(|(_, stored)| stored.expires_at_ms)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            entries.remove(&key);
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(stored) if now < stored.expires_at_ms => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(key) {
            Self::evict_if_full(&mut entries, self.max_entries);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: String, ttl: Duration) -> Result<bool> {
        let now = self.clock.now_millis();
        let mut entries = self.entries.lock().await;
        if let Some(stored) = entries.get(key) {
            if now < stored.expires_at_ms {
                return Ok(false);
            }
        }
        if !entries.contains_key(key) {
            Self::evict_if_full(&mut entries, self.max_entries);
        }
        entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
            },
        );
        Ok(true)
    }
}
