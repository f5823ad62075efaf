use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{GatewayError, Result};
use crate::limits::RateConfig;

/// Accepted when no api_keys are configured. Development convenience only;
/// startup logs a warning whenever it is active.
pub const DEV_API_KEY: &str = "dev-key";

/// One configured API key, optionally carrying its own bucket shape.
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_per_second: Option<f64>,
}

impl std::fmt::Debug for ApiKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyConfig")
            .field("key", &"<redacted>")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("refill_per_second", &self.refill_per_second)
            .finish()
    }
}

/// The quota identity a request is tagged with on admission; the rate
/// limiter keys its buckets by `id`, never by the secret.
#[derive(Clone, Debug)]
pub struct QuotaIdentity {
    pub id: String,
    pub rate: Option<RateConfig>,
}

pub struct Admission {
    keys: HashMap<String, QuotaIdentity>,
    dev_fallback: bool,
}

impl Admission {
    pub fn new(configs: &[ApiKeyConfig]) -> Self {
        let mut keys = HashMap::new();
        for config in configs {
            let id = config
                .id
                .clone()
                .unwrap_or_else(|| derived_key_id(&config.key));
            let rate = match (config.capacity, config.refill_per_second) {
                (None, None) => None,
                (capacity, refill) => {
                    let default = RateConfig::default();
                    Some(RateConfig {
                        capacity: capacity.unwrap_or(default.capacity),
                        refill_per_second: refill.unwrap_or(default.refill_per_second),
                    })
                }
            };
            keys.insert(config.key.clone(), QuotaIdentity { id, rate });
        }
        Self {
            dev_fallback: keys.is_empty(),
            keys,
        }
    }

    pub fn dev_fallback_active(&self) -> bool {
        self.dev_fallback
    }

    pub fn authorize(&self, presented: Option<&str>) -> Result<QuotaIdentity> {
        let Some(presented) = presented else {
            return Err(GatewayError::Unauthorized);
        };
        if let Some(identity) = self.keys.get(presented) {
            return Ok(identity.clone());
        }
        if self.dev_fallback && presented == DEV_API_KEY {
            return Ok(QuotaIdentity {
                id: "dev".to_string(),
                rate: None,
            });
        }
        Err(GatewayError::Unauthorized)
    }
}

/// Stable non-secret identifier for keys configured without an explicit id.
fn derived_key_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let mut short = String::with_capacity(8);
    for byte in &digest[..4] {
        short.push_str(&format!("{byte:02x}"));
    }
    format!("key-{short}")
}
