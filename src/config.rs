use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::admission::ApiKeyConfig;
use crate::limits::RateConfig;

/// Gateway configuration, loaded from a JSON file. Every field has a default
/// so a minimal deployment can start from `{}`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub api_keys: Vec<ApiKeyConfig>,
    pub default_rate: RateConfig,
    pub cache_enabled: bool,
    pub cache_backend: Option<String>,
    pub cache_ttl_default_s: u64,
    pub negative_ttl_s: u64,
    pub cache_max_entries: usize,
    pub backend_url: String,
    pub backend_timeout_s: u64,
    pub backend_max_retries: u32,
    pub backend_total_deadline_s: u64,
    pub request_deadline_s: u64,
    pub max_tokens_ceiling: u32,
    pub prompt_max_chars: usize,
    pub batch_max_concurrency: usize,
    pub batch_deadline_s: Option<u64>,
    pub model_refresh_interval_s: u64,
    pub model_aliases: BTreeMap<String, String>,
    pub profile_extra_state_keys: Vec<String>,
    pub schema_version: u32,
    pub strict_startup: bool,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            api_keys: Vec::new(),
            default_rate: RateConfig::default(),
            cache_enabled: true,
            cache_backend: None,
            cache_ttl_default_s: 3600,
            negative_ttl_s: 30,
            cache_max_entries: 10_000,
            backend_url: "http://127.0.0.1:11434".to_string(),
            backend_timeout_s: 30,
            backend_max_retries: 3,
            backend_total_deadline_s: 90,
            // A small multiple of the per-attempt timeout.
            request_deadline_s: 120,
            max_tokens_ceiling: 2000,
            prompt_max_chars: 8192,
            batch_max_concurrency: 10,
            batch_deadline_s: None,
            model_refresh_interval_s: 60,
            model_aliases: BTreeMap::new(),
            profile_extra_state_keys: Vec::new(),
            schema_version: 1,
            strict_startup: false,
            log_level: "info".to_string(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_address", &self.bind_address)
            .field("api_keys", &format!("[{} keys]", self.api_keys.len()))
            .field("backend_url", &self.backend_url)
            .field("cache_enabled", &self.cache_enabled)
            .field("schema_version", &self.schema_version)
            .field("log_level", &self.log_level)
            .finish_non_exhaustive()
    }
}

impl GatewayConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|err| format!("cannot read {}: {err}", path.as_ref().display()))?;
        let config: GatewayConfig =
            serde_json::from_str(&raw).map_err(|err| format!("invalid config: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("invalid bind_address: {}", self.bind_address));
        }
        if self.backend_url.trim().is_empty() {
            return Err("backend_url must not be empty".to_string());
        }
        if self.default_rate.capacity < 1.0 {
            return Err("default_rate.capacity must be at least 1".to_string());
        }
        if self.default_rate.refill_per_second <= 0.0 {
            return Err("default_rate.refill_per_second must be positive".to_string());
        }
        for key in &self.api_keys {
            if key.key.trim().is_empty() {
                return Err("api key must not be empty".to_string());
            }
            if let Some(capacity) = key.capacity {
                if capacity < 1.0 {
                    return Err("per-key capacity must be at least 1".to_string());
                }
            }
            if let Some(refill) = key.refill_per_second {
                if refill <= 0.0 {
                    return Err("per-key refill_per_second must be positive".to_string());
                }
            }
        }
        match self.cache_backend.as_deref() {
            None | Some("memory") => {}
            Some(other) => {
                return Err(format!(
                    "unsupported cache_backend '{other}'; only 'memory' is built in"
                ));
            }
        }
        if self.cache_ttl_default_s == 0 {
            return Err("cache_ttl_default_s must be positive".to_string());
        }
        if self.cache_max_entries == 0 {
            return Err("cache_max_entries must be positive".to_string());
        }
        if self.backend_timeout_s == 0 {
            return Err("backend_timeout_s must be positive".to_string());
        }
        if self.request_deadline_s == 0 {
            return Err("request_deadline_s must be positive".to_string());
        }
        if self.max_tokens_ceiling == 0 {
            return Err("max_tokens_ceiling must be positive".to_string());
        }
        if self.batch_max_concurrency == 0 {
            return Err("batch_max_concurrency must be positive".to_string());
        }
        if self.model_refresh_interval_s == 0 {
            return Err("model_refresh_interval_s must be positive".to_string());
        }
        Ok(())
    }
}
