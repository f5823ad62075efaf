use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::fingerprint::Fingerprint;
use crate::single_flight::SingleFlight;
use crate::store::CacheStore;
use crate::types::{CachePolicy, CacheStatus};
use crate::util::Clock;

/// Cached completion record. Immutable once written; the fingerprint is the
/// store key and is not repeated in the body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedCompletion {
    pub response_text: String,
    pub model_used: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub created_at_ms: u64,
    pub ttl_s: u64,
}

/// What the store holds under a fingerprint key: a completion, or a
/// short-lived record of a deterministic failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum StoredEntry {
    Completion(CachedCompletion),
    Failure { status: u16, message: String },
}

#[derive(Clone, Debug)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl: Duration,
    pub negative_ttl: Duration,
    pub schema_version: u32,
}

pub enum CacheLookup {
    Hit(CachedCompletion),
    NegativeHit(GatewayError),
    Miss,
}

/// Response cache over the external key-value store, with per-process
/// single-flight gating. Store failures degrade to misses; they never fail a
/// request.
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    flights: Arc<SingleFlight<CachedCompletion>>,
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn CacheStore>, settings: CacheSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            flights: Arc::new(SingleFlight::default()),
            settings,
            clock,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.settings.default_ttl
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn key(&self, fingerprint: &Fingerprint) -> String {
        format!("llm:v{}:{}", self.settings.schema_version, fingerprint.to_hex())
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> CacheLookup {
        let key = self.key(fingerprint);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return CacheLookup::Miss,
            Err(err) => {
                warn!(error = %err, "cache get failed, treating as miss");
                return CacheLookup::Miss;
            }
        };
        match serde_json::from_str::<StoredEntry>(&raw) {
            Ok(StoredEntry::Completion(entry)) => CacheLookup::Hit(entry),
            Ok(StoredEntry::Failure { status, message }) => {
                CacheLookup::NegativeHit(GatewayError::BackendRejected { status, message })
            }
            Err(err) => {
                warn!(error = %err, "undecodable cache entry, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    /// Write a completion. Under `use` policy an existing entry wins; only a
    /// refresh overwrites.
    pub async fn put(&self, fingerprint: &Fingerprint, entry: &CachedCompletion, overwrite: bool) {
        let key = self.key(fingerprint);
        let ttl = Duration::from_secs(entry.ttl_s);
        if ttl.is_zero() {
            return;
        }
        let raw = match serde_json::to_string(&StoredEntry::Completion(entry.clone())) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to encode cache entry");
                return;
            }
        };
        let result = if overwrite {
            self.store.set_ttl(&key, raw, ttl).await.map(|_| true)
        } else {
            self.store.set_if_absent(&key, raw, ttl).await
        };
        if let Err(err) = result {
            warn!(error = %err, "cache write failed");
        }
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) {
        if let Err(err) = self.store.delete(&self.key(fingerprint)).await {
            warn!(error = %err, "cache invalidate failed");
        }
    }

    async fn put_negative(&self, fingerprint: &Fingerprint, error: &GatewayError) {
        let GatewayError::BackendRejected { status, message } = error else {
            return;
        };
        if self.settings.negative_ttl.is_zero() {
            return;
        }
        let entry = StoredEntry::Failure {
            status: *status,
            message: message.clone(),
        };
        let raw = match serde_json::to_string(&entry) {
            Ok(raw) => raw,
            Err(_) => return,
        };
        let key = self.key(fingerprint);
        if let Err(err) = self
            .store
            .set_if_absent(&key, raw, self.settings.negative_ttl)
            .await
        {
            warn!(error = %err, "negative cache write failed");
        }
    }

    /// Canonical entry point for the pipeline: resolve the policy, consult
    /// the cache, and coalesce concurrent misses onto one computation. The
    /// cache write happens inside the flight, before any waiter observes the
    /// result.
    pub async fn get_or_compute<F, Fut>(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        policy: CachePolicy,
        compute: F,
    ) -> (Result<CachedCompletion>, CacheStatus, bool)
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<CachedCompletion>> + Send + 'static,
    {
        if !self.settings.enabled || policy == CachePolicy::Bypass {
            return (compute().await, CacheStatus::Bypass, false);
        }

        let status = match policy {
            CachePolicy::Use => {
                match self.get(&fingerprint).await {
                    CacheLookup::Hit(entry) => return (Ok(entry), CacheStatus::Hit, false),
                    CacheLookup::NegativeHit(error) => {
                        return (Err(error), CacheStatus::Hit, false)
                    }
                    CacheLookup::Miss => CacheStatus::Miss,
                }
            }
            CachePolicy::Refresh => CacheStatus::Refresh,
            CachePolicy::Bypass => unreachable!("bypass handled above"),
        };

        let overwrite = policy == CachePolicy::Refresh;
        let cache = Arc::clone(self);
        let (outcome, coalesced) = self
            .flights
            .run(fingerprint, move || {
                let cache = Arc::clone(&cache);
                let compute = compute.clone();
                async move {
                    match compute().await {
                        Ok(entry) => {
                            cache.put(&fingerprint, &entry, overwrite).await;
                            Ok(entry)
                        }
                        Err(error) => {
                            if error.is_negative_cacheable() {
                                cache.put_negative(&fingerprint, &error).await;
                            }
                            Err(error)
                        }
                    }
                }
            })
            .await;
        (outcome, status, coalesced)
    }
}
