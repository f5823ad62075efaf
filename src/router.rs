use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{GatewayError, Result};
use crate::util::Clock;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelHealth {
    Ready,
    Warming,
    Unavailable,
}

#[derive(Clone, Debug, Serialize)]
pub struct ModelRecord {
    pub name: String,
    pub health: ModelHealth,
    pub checked_at_ms: u64,
}

#[derive(Debug, Default)]
struct ModelSnapshot {
    models: BTreeMap<String, ModelRecord>,
    refreshed_at_ms: u64,
}

/// Maps logical model names onto backend model identifiers, gated on health.
/// The snapshot is replaced atomically on refresh; readers take a consistent
/// reference. A model marked unavailable after a hard backend failure must
/// survive one full refresh cycle (as warming) before serving again.
pub struct ModelRouter {
    aliases: BTreeMap<String, String>,
    snapshot: RwLock<Arc<ModelSnapshot>>,
    clock: Arc<dyn Clock>,
}

impl ModelRouter {
    pub fn new(aliases: BTreeMap<String, String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            aliases,
            snapshot: RwLock::new(Arc::new(ModelSnapshot::default())),
            clock,
        }
    }

    /// Resolve a logical name to a servable backend model. Tries, in order:
    /// exact match, suffix-stripped match (`mistral` finds `mistral:7b`),
    /// then the configured alias map.
    pub async fn resolve(&self, logical: &str) -> Result<String> {
        let snapshot = self.snapshot.read().await.clone();

        if let Some(name) = resolve_in(&snapshot, logical) {
            return name;
        }

        if let Some(target) = self.aliases.get(logical) {
            if let Some(name) = resolve_in(&snapshot, target) {
                return name;
            }
        }

        Err(GatewayError::ModelUnavailable {
            model: logical.to_string(),
        })
    }

    /// Replace the snapshot from a fresh backend listing. Models previously
    /// marked unavailable re-enter as warming and become ready on the next
    /// refresh that still lists them.
    pub async fn refresh_from(&self, backend: &dyn Backend) -> Result<()> {
        let names = backend.list_models().await?;
        let now = self.clock.now_millis();

        let mut snapshot = self.snapshot.write().await;
        let previous = Arc::clone(&snapshot);
        let mut models = BTreeMap::new();
        for name in names {
            let health = match previous.models.get(&name).map(|record| record.health) {
                Some(ModelHealth::Unavailable) => ModelHealth::Warming,
                Some(ModelHealth::Warming) | Some(ModelHealth::Ready) | None => ModelHealth::Ready,
            };
            models.insert(
                name.clone(),
                ModelRecord {
                    name,
                    health,
                    checked_at_ms: now,
                },
            );
        }
        debug!(models = models.len(), "model snapshot refreshed");
        *snapshot = Arc::new(ModelSnapshot {
            models,
            refreshed_at_ms: now,
        });
        Ok(())
    }

    /// Invalidate one model after a hard backend failure. The next refresh
    /// decides when it serves again.
    pub async fn mark_unavailable(&self, backend_name: &str) {
        let now = self.clock.now_millis();
        let mut snapshot = self.snapshot.write().await;
        if !snapshot.models.contains_key(backend_name) {
            return;
        }
        let mut models = snapshot.models.clone();
        if let Some(record) = models.get_mut(backend_name) {
            record.health = ModelHealth::Unavailable;
            record.checked_at_ms = now;
        }
        let refreshed_at_ms = snapshot.refreshed_at_ms;
        *snapshot = Arc::new(ModelSnapshot {
            models,
            refreshed_at_ms,
        });
    }

    /// True once at least one model is servable; the readiness probe gates on
    /// this.
    pub async fn any_ready(&self) -> bool {
        let snapshot = self.snapshot.read().await;
        snapshot
            .models
            .values()
            .any(|record| record.health == ModelHealth::Ready)
    }

    pub async fn records(&self) -> Vec<ModelRecord> {
        let snapshot = self.snapshot.read().await;
        snapshot.models.values().cloned().collect()
    }

    pub async fn refreshed_at_ms(&self) -> u64 {
        self.snapshot.read().await.refreshed_at_ms
    }

    /// Periodic snapshot refresh, spawned at startup.
    pub fn spawn_refresh_task(
        router: Arc<Self>,
        backend: Arc<dyn Backend>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = router.refresh_from(backend.as_ref()).await {
                    warn!(error = %err, "model snapshot refresh failed");
                }
            }
        })
    }
}

fn resolve_in(snapshot: &ModelSnapshot, requested: &str) -> Option<Result<String>> {
    if let Some(record) = snapshot.models.get(requested) {
        return Some(servable(record));
    }

    // Suffix matching: a bare name finds its tagged variants, and a tagged
    // name falls back to its base. First match in lexicographic order wins.
    let base = requested.split(':').next().unwrap_or(requested);
    snapshot
        .models
        .values()
        .find(|record| {
            record.name.split(':').next().unwrap_or(&record.name) == base
        })
        .map(servable)
}

fn servable(record: &ModelRecord) -> Result<String> {
    match record.health {
        ModelHealth::Ready => Ok(record.name.clone()),
        ModelHealth::Warming | ModelHealth::Unavailable => Err(GatewayError::ModelUnavailable {
            model: record.name.clone(),
        }),
    }
}
