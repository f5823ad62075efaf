use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::types::{CacheStatus, TokenUsage};

#[derive(Debug)]
struct DurationHistogram {
    buckets: [f64; 11],
    bucket_counts: [u64; 11],
    sum_seconds: f64,
    count: u64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: [
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
            bucket_counts: [0; 11],
            sum_seconds: 0.0,
            count: 0,
        }
    }
}

impl DurationHistogram {
    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in self.buckets.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[idx] = self.bucket_counts[idx].saturating_add(1);
            }
        }
    }
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_by_model_outcome: HashMap<String, HashMap<String, u64>>,
    cache_status_total: HashMap<&'static str, u64>,
    single_flight_coalesced_total: u64,
    rate_limited_total: u64,
    retries_by_cause: HashMap<String, u64>,
    backend_responses_by_class: HashMap<String, u64>,
    prompt_tokens_by_model: HashMap<String, u64>,
    completion_tokens_by_model: HashMap<String, u64>,
    timeouts_by_stage: HashMap<String, u64>,
    batch_requests_total: u64,
    backend_latency_seconds: DurationHistogram,
    request_latency_seconds: DurationHistogram,
}

/// Counter snapshot for tests and diagnostics; the scrape surface is
/// [`Metrics::render`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_refreshes: u64,
    pub cache_bypasses: u64,
    pub single_flight_coalesced: u64,
    pub rate_limited: u64,
    pub retries: u64,
    pub batch_requests: u64,
    pub in_flight: i64,
}

/// Gateway metrics: counters and histograms behind one mutex, plus an atomic
/// in-flight gauge so the RAII guard can decrement without locking.
#[derive(Default)]
pub struct Metrics {
    inner: Mutex<MetricsInner>,
    in_flight: AtomicI64,
}

pub struct InFlightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn track_in_flight(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub async fn record_request(&self, model: &str, outcome: &str) {
        let mut inner = self.inner.lock().await;
        *inner
            .requests_by_model_outcome
            .entry(model.to_string())
            .or_default()
            .entry(outcome.to_string())
            .or_default() += 1;
    }

    pub async fn record_cache_status(&self, status: CacheStatus) {
        let mut inner = self.inner.lock().await;
        *inner.cache_status_total.entry(status.as_str()).or_default() += 1;
    }

    pub async fn record_coalesced(&self) {
        let mut inner = self.inner.lock().await;
        inner.single_flight_coalesced_total += 1;
    }

    pub async fn record_rate_limited(&self) {
        let mut inner = self.inner.lock().await;
        inner.rate_limited_total += 1;
    }

    pub async fn record_retry(&self, cause: &str) {
        let mut inner = self.inner.lock().await;
        *inner.retries_by_cause.entry(cause.to_string()).or_default() += 1;
    }

    pub async fn record_backend_status(&self, status: u16) {
        let class = format!("{}xx", status / 100);
        let mut inner = self.inner.lock().await;
        *inner.backend_responses_by_class.entry(class).or_default() += 1;
    }

    pub async fn record_tokens(&self, model: &str, usage: TokenUsage) {
        let mut inner = self.inner.lock().await;
        if let Some(prompt) = usage.prompt {
            *inner
                .prompt_tokens_by_model
                .entry(model.to_string())
                .or_default() += prompt;
        }
        if let Some(completion) = usage.completion {
            *inner
                .completion_tokens_by_model
                .entry(model.to_string())
                .or_default() += completion;
        }
    }

    pub async fn record_timeout(&self, stage: &str) {
        let mut inner = self.inner.lock().await;
        *inner.timeouts_by_stage.entry(stage.to_string()).or_default() += 1;
    }

    pub async fn record_batch(&self) {
        let mut inner = self.inner.lock().await;
        inner.batch_requests_total += 1;
    }

    pub async fn observe_backend_latency(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        inner.backend_latency_seconds.observe(duration);
    }

    pub async fn observe_request_latency(&self, duration: Duration) {
        let mut inner = self.inner.lock().await;
        inner.request_latency_seconds.observe(duration);
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().await;
        let status = |s: &str| inner.cache_status_total.get(s).copied().unwrap_or(0);
        MetricsSnapshot {
            requests_total: inner
                .requests_by_model_outcome
                .values()
                .flat_map(|outcomes| outcomes.values())
                .sum(),
            cache_hits: status("hit"),
            cache_misses: status("miss"),
            cache_refreshes: status("refresh"),
            cache_bypasses: status("bypass"),
            single_flight_coalesced: inner.single_flight_coalesced_total,
            rate_limited: inner.rate_limited_total,
            retries: inner.retries_by_cause.values().sum(),
            batch_requests: inner.batch_requests_total,
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition.
    pub async fn render(&self) -> String {
        let inner = self.inner.lock().await;
        let mut out = String::new();

        out.push_str("# HELP llm_gateway_requests_total Requests received, by model and outcome.\n");
        out.push_str("# TYPE llm_gateway_requests_total counter\n");
        let mut models: Vec<&String> = inner.requests_by_model_outcome.keys().collect();
        models.sort();
        for model in models {
            let outcomes = &inner.requests_by_model_outcome[model];
            let mut keys: Vec<&String> = outcomes.keys().collect();
            keys.sort();
            for outcome in keys {
                out.push_str(&format!(
                    "llm_gateway_requests_total{{model=\"{}\",outcome=\"{}\"}} {}\n",
                    escape_label_value(model),
                    escape_label_value(outcome),
                    outcomes[outcome]
                ));
            }
        }

        let cache_status: HashMap<String, u64> = inner
            .cache_status_total
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        write_counter_map(
            &mut out,
            "llm_gateway_cache_requests_total",
            "Cache lookups by resulting status.",
            "status",
            &cache_status,
        );

        write_scalar_counter(
            &mut out,
            "llm_gateway_single_flight_coalesced_total",
            "Requests coalesced onto an in-flight computation.",
            inner.single_flight_coalesced_total,
        );

        write_scalar_counter(
            &mut out,
            "llm_gateway_rate_limited_total",
            "Requests rejected by the rate limiter.",
            inner.rate_limited_total,
        );

        write_counter_map(
            &mut out,
            "llm_gateway_backend_retries_total",
            "Backend retries by cause.",
            "cause",
            &inner.retries_by_cause,
        );

        write_counter_map(
            &mut out,
            "llm_gateway_backend_responses_total",
            "Backend error responses by status class.",
            "class",
            &inner.backend_responses_by_class,
        );

        write_counter_map(
            &mut out,
            "llm_gateway_prompt_tokens_total",
            "Prompt tokens processed, by model.",
            "model",
            &inner.prompt_tokens_by_model,
        );

        write_counter_map(
            &mut out,
            "llm_gateway_completion_tokens_total",
            "Completion tokens produced, by model.",
            "model",
            &inner.completion_tokens_by_model,
        );

        write_counter_map(
            &mut out,
            "llm_gateway_timeouts_total",
            "Deadline expiries by pipeline stage.",
            "stage",
            &inner.timeouts_by_stage,
        );

        write_scalar_counter(
            &mut out,
            "llm_gateway_batch_requests_total",
            "Batch requests received.",
            inner.batch_requests_total,
        );

        write_histogram(
            &mut out,
            "llm_gateway_backend_latency_seconds",
            "Backend call latency.",
            &inner.backend_latency_seconds,
        );

        write_histogram(
            &mut out,
            "llm_gateway_request_latency_seconds",
            "End-to-end request latency.",
            &inner.request_latency_seconds,
        );

        out.push_str("# HELP llm_gateway_active_requests In-flight pipeline invocations.\n");
        out.push_str("# TYPE llm_gateway_active_requests gauge\n");
        out.push_str(&format!(
            "llm_gateway_active_requests {}\n",
            self.in_flight.load(Ordering::Relaxed)
        ));

        out
    }
}

fn write_scalar_counter(out: &mut String, metric: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    out.push_str(&format!("{metric} {value}\n"));
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} counter\n"));
    let mut entries: Vec<(&String, &u64)> = map.iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (value, count) in entries {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {count}\n",
            escape_label_value(value)
        ));
    }
}

fn write_histogram(out: &mut String, metric: &str, help: &str, hist: &DurationHistogram) {
    out.push_str(&format!("# HELP {metric} {help}\n"));
    out.push_str(&format!("# TYPE {metric} histogram\n"));
    for (bound, count) in hist.buckets.iter().zip(hist.bucket_counts.iter()) {
        out.push_str(&format!("{metric}_bucket{{le=\"{bound}\"}} {count}\n"));
    }
    out.push_str(&format!(
        "{metric}_bucket{{le=\"+Inf\"}} {}\n",
        hist.count
    ));
    out.push_str(&format!("{metric}_sum {}\n", hist.sum_seconds));
    out.push_str(&format!("{metric}_count {}\n", hist.count));
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_land_in_the_rendered_text() {
        let metrics = Arc::new(Metrics::default());
        metrics.record_request("mistral:7b", "ok").await;
        metrics.record_request("mistral:7b", "backend_error").await;
        metrics.record_cache_status(CacheStatus::Hit).await;
        metrics.record_coalesced().await;
        metrics.record_rate_limited().await;
        metrics.record_retry("status_503").await;
        metrics.record_backend_status(503).await;
        metrics
            .record_tokens(
                "mistral:7b",
                TokenUsage {
                    prompt: Some(12),
                    completion: Some(34),
                },
            )
            .await;
        metrics
            .observe_backend_latency(Duration::from_millis(120))
            .await;

        let rendered = metrics.render().await;
        assert!(rendered
            .contains("llm_gateway_requests_total{model=\"mistral:7b\",outcome=\"ok\"} 1"));
        assert!(rendered.contains("llm_gateway_cache_requests_total{status=\"hit\"} 1"));
        assert!(rendered.contains("llm_gateway_single_flight_coalesced_total 1"));
        assert!(rendered.contains("llm_gateway_rate_limited_total 1"));
        assert!(rendered.contains("llm_gateway_backend_retries_total{cause=\"status_503\"} 1"));
        assert!(rendered.contains("llm_gateway_backend_responses_total{class=\"5xx\"} 1"));
        assert!(rendered.contains("llm_gateway_prompt_tokens_total{model=\"mistral:7b\"} 12"));
        assert!(rendered.contains("llm_gateway_completion_tokens_total{model=\"mistral:7b\"} 34"));
        assert!(rendered.contains("llm_gateway_backend_latency_seconds_count 1"));
    }

    #[tokio::test]
    async fn in_flight_gauge_tracks_guards() {
        let metrics = Arc::new(Metrics::default());
        let guard_a = metrics.track_in_flight();
        let guard_b = metrics.track_in_flight();
        assert_eq!(metrics.snapshot().await.in_flight, 2);
        drop(guard_a);
        assert_eq!(metrics.snapshot().await.in_flight, 1);
        drop(guard_b);
        assert_eq!(metrics.snapshot().await.in_flight, 0);
    }

    #[tokio::test]
    async fn null_token_counts_are_skipped() {
        let metrics = Arc::new(Metrics::default());
        metrics
            .record_tokens("m", TokenUsage::default())
            .await;
        let rendered = metrics.render().await;
        assert!(!rendered.contains("llm_gateway_prompt_tokens_total{model=\"m\"}"));
    }

    #[tokio::test]
    async fn histogram_buckets_are_cumulative() {
        let metrics = Arc::new(Metrics::default());
        metrics
            .observe_request_latency(Duration::from_millis(30))
            .await;
        metrics
            .observe_request_latency(Duration::from_millis(300))
            .await;
        let rendered = metrics.render().await;
        assert!(rendered.contains("llm_gateway_request_latency_seconds_bucket{le=\"0.05\"} 1"));
        assert!(rendered.contains("llm_gateway_request_latency_seconds_bucket{le=\"0.5\"} 2"));
        assert!(rendered.contains("llm_gateway_request_latency_seconds_bucket{le=\"+Inf\"} 2"));
    }
}
