use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{GatewayError, Result};
use crate::util::Clock;

/// Token-bucket shape for one quota identity.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateConfig {
    pub capacity: f64,
    pub refill_per_second: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_per_second: 1.0,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill_ms: u64,
    rate: RateConfig,
}

#[derive(Debug, Default)]
struct BucketMap {
    buckets: HashMap<String, Bucket>,
    last_gc_minute: u64,
}

/// Per-key token-bucket rate limiter. Buckets refill continuously and are
/// evicted once idle for ten refill periods; the limiter rejects instead of
/// queueing.
pub struct RateLimiter {
    default_rate: RateConfig,
    state: Mutex<BucketMap>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(default_rate: RateConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            default_rate,
            state: Mutex::new(BucketMap::default()),
            clock,
        }
    }

    /// Admit or reject one request for `key_id`. `rate` overrides the default
    /// bucket shape for keys that carry one in config.
    pub async fn check(&self, key_id: &str, rate: Option<RateConfig>) -> Result<()> {
        let rate = rate.unwrap_or(self.default_rate);
        let now_ms = self.clock.now_millis();

        let mut state = self.state.lock().await;

        let minute = now_ms / 60_000;
        if minute != state.last_gc_minute {
            state.last_gc_minute = minute;
            state
                .buckets
                .retain(|_, bucket| now_ms.saturating_sub(bucket.last_refill_ms) < idle_ttl_ms(&bucket.rate));
        }

        let bucket = state.buckets.entry(key_id.to_string()).or_insert(Bucket {
            tokens: rate.capacity,
            last_refill_ms: now_ms,
            rate,
        });

        let elapsed_s = now_ms.saturating_sub(bucket.last_refill_ms) as f64 / 1_000.0;
        bucket.tokens = (bucket.tokens + elapsed_s * bucket.rate.refill_per_second)
            .min(bucket.rate.capacity);
        bucket.last_refill_ms = now_ms;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return Ok(());
        }

        let deficit = 1.0 - bucket.tokens;
        let retry_after_secs = (deficit / bucket.rate.refill_per_second).ceil().max(1.0) as u64;
        Err(GatewayError::RateLimited { retry_after_secs })
    }

    #[cfg(test)]
    async fn bucket_count(&self) -> usize {
        self.state.lock().await.buckets.len()
    }
}

fn idle_ttl_ms(rate: &RateConfig) -> u64 {
    // Ten refill periods, floored at one minute so slow buckets survive GC
    // between bursts.
    let refill_period_ms = 1_000.0 / rate.refill_per_second.max(f64::MIN_POSITIVE);
    (refill_period_ms * 10.0).max(60_000.0) as u64
}
