use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{GatewayError, Result};
use crate::metrics::Metrics;
use crate::types::ChatMessage;
use crate::util::hash64_fnv1a;

const MAX_ERROR_BODY_CHARS: usize = 4096;
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const BACKOFF_JITTER_MS: u64 = 250;

/// Effective decoding controls handed to the backend.
#[derive(Clone, Debug)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub seed: Option<i64>,
}

#[derive(Clone, Debug)]
pub struct ChatOptions {
    pub temperature: f64,
    pub max_tokens: u32,
}

/// Completion returned by the backend. Token counts are whatever the backend
/// reported, which may be nothing.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendHealth {
    Ok,
    Unavailable,
}

/// Transport seam to the text-generation host.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationResult>;

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<GenerationResult>;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn health(&self) -> BackendHealth;
}

#[derive(Clone, Copy, Debug)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub total_deadline: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            total_deadline: Duration::from_secs(90),
        }
    }
}

/// Exponential backoff with a deterministic jitter derived from the request,
/// capped at a few seconds.
fn backoff_delay(attempt: u32, jitter_seed: u64) -> Duration {
    let exponential = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    let jitter_ms = hash64_fnv1a(&jitter_seed.wrapping_add(u64::from(attempt)).to_le_bytes())
        % BACKOFF_JITTER_MS;
    exponential.min(BACKOFF_CAP) + Duration::from_millis(jitter_ms)
}

/// Short cause label for retry metrics. Transient messages are built in this
/// module with fixed prefixes.
pub(crate) fn retry_cause(error: &GatewayError) -> &'static str {
    let GatewayError::BackendTransient { message, .. } = error else {
        return "other";
    };
    if message.starts_with("timeout") {
        "timeout"
    } else if message.starts_with("connect") {
        "connect"
    } else if message.starts_with("status 429") {
        "status_429"
    } else if message.starts_with("status 5") {
        "status_5xx"
    } else {
        "transient"
    }
}

/// Run `f` until it succeeds, fails permanently, or the retry budget is
/// spent. Only transient failures are retried; a `Retry-After` hint takes
/// precedence over the computed backoff. Exhaustion surfaces as a plain
/// backend error so no layer above ever retries again.
pub(crate) async fn with_retry<T, F, Fut>(
    settings: &RetrySettings,
    jitter_seed: u64,
    mut on_retry: impl FnMut(&GatewayError),
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = tokio::time::Instant::now();
    for attempt in 0..=settings.max_retries {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt < settings.max_retries => {
                let delay = error
                    .retry_after()
                    .unwrap_or_else(|| backoff_delay(attempt, jitter_seed));
                if started.elapsed() + delay >= settings.total_deadline {
                    return Err(exhausted(error));
                }
                on_retry(&error);
                tokio::time::sleep(delay).await;
            }
            Err(error) if error.is_transient() => return Err(exhausted(error)),
            Err(error) => return Err(error),
        }
    }
    Err(GatewayError::internal("retry loop fell through"))
}

fn exhausted(error: GatewayError) -> GatewayError {
    match error {
        GatewayError::BackendTransient { message, .. } => GatewayError::Backend {
            message: format!("retries exhausted: {message}"),
        },
        other => other,
    }
}

/// Decorator adding retry behaviour and backend-side metrics to any
/// transport. Retries live here and only here; the pipeline never retries.
pub struct RetryingBackend {
    inner: Arc<dyn Backend>,
    settings: RetrySettings,
    metrics: Arc<Metrics>,
}

impl RetryingBackend {
    pub fn new(inner: Arc<dyn Backend>, settings: RetrySettings, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            settings,
            metrics,
        }
    }

    async fn record(&self, causes: &[&'static str], outcome: &Result<GenerationResult>) {
        for cause in causes {
            self.metrics.record_retry(cause).await;
            match *cause {
                "status_5xx" => self.metrics.record_backend_status(503).await,
                "status_429" => self.metrics.record_backend_status(429).await,
                _ => {}
            }
        }
        if let Err(GatewayError::BackendRejected { status, .. }) = outcome {
            self.metrics.record_backend_status(*status).await;
        }
    }
}

#[async_trait]
impl Backend for RetryingBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let seed = hash64_fnv1a(model.as_bytes()) ^ hash64_fnv1a(prompt.as_bytes());
        let mut causes = Vec::new();
        let outcome = with_retry(
            &self.settings,
            seed,
            |error| {
                warn!(model, error = %error, "retrying backend generate");
                causes.push(retry_cause(error));
            },
            || self.inner.generate(model, prompt, options),
        )
        .await;
        self.record(&causes, &outcome).await;
        outcome
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<GenerationResult> {
        let seed = hash64_fnv1a(model.as_bytes());
        let mut causes = Vec::new();
        let outcome = with_retry(
            &self.settings,
            seed,
            |error| {
                warn!(model, error = %error, "retrying backend chat");
                causes.push(retry_cause(error));
            },
            || self.inner.chat(model, messages, options),
        )
        .await;
        self.record(&causes, &outcome).await;
        outcome
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        // The router refreshes on its own schedule; a failed listing is not
        // worth a retry storm.
        self.inner.list_models().await
    }

    async fn health(&self) -> BackendHealth {
        self.inner.health().await
    }
}

// Ollama wire format.

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaGenerateOptions<'a>,
}

fn slice_is_empty(slice: &&[String]) -> bool {
    slice.is_empty()
}

#[derive(Serialize)]
struct OllamaGenerateOptions<'a> {
    temperature: f64,
    top_p: f64,
    top_k: u32,
    repeat_penalty: f64,
    num_predict: u32,
    #[serde(skip_serializing_if = "slice_is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    model: String,
    response: String,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaChatOptions,
}

#[derive(Serialize)]
struct OllamaChatOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    model: String,
    message: ChatMessage,
    prompt_eval_count: Option<u64>,
    eval_count: Option<u64>,
}

#[derive(Deserialize)]
struct OllamaTagsResponse {
    models: Vec<OllamaModelTag>,
}

#[derive(Deserialize)]
struct OllamaModelTag {
    name: String,
}

/// Single-attempt HTTP transport for an Ollama-style host: `/api/generate`,
/// `/api/chat`, `/api/tags`. Concurrency-safe; unrelated requests are never
/// serialized. Wrap in [`RetryingBackend`] for retry behaviour.
pub struct OllamaBackend {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, attempt_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .map_err(|err| GatewayError::internal(format!("http client: {err}")))?;
        let base_url = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &impl Serialize) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        decode_response(response).await
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let body = OllamaGenerateRequest {
            model,
            prompt,
            stream: false,
            options: OllamaGenerateOptions {
                temperature: options.temperature,
                top_p: options.top_p,
                top_k: options.top_k,
                repeat_penalty: options.repeat_penalty,
                num_predict: options.max_tokens,
                stop: &options.stop,
                seed: options.seed,
            },
        };
        let response: OllamaGenerateResponse = self.post_json("/api/generate", &body).await?;
        Ok(GenerationResult {
            text: response.response,
            model: response.model,
            prompt_tokens: response.prompt_eval_count,
            completion_tokens: response.eval_count,
        })
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<GenerationResult> {
        let body = OllamaChatRequest {
            model,
            messages,
            stream: false,
            options: OllamaChatOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };
        let response: OllamaChatResponse = self.post_json("/api/chat", &body).await?;
        Ok(GenerationResult {
            text: response.message.content,
            model: response.model,
            prompt_tokens: response.prompt_eval_count,
            completion_tokens: response.eval_count,
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let tags: OllamaTagsResponse = decode_response(response).await?;
        Ok(tags.models.into_iter().map(|tag| tag.name).collect())
    }

    async fn health(&self) -> BackendHealth {
        let url = format!("{}/api/tags", self.base_url);
        let probe = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await;
        match probe {
            Ok(response) if response.status().is_success() => BackendHealth::Ok,
            _ => BackendHealth::Unavailable,
        }
    }
}

async fn decode_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|err| GatewayError::Backend {
                message: format!("response decode error: {err}"),
            });
    }

    let retry_after_secs = response
        .headers()
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(
        status.as_u16(),
        retry_after_secs,
        truncate_chars(&body, MAX_ERROR_BODY_CHARS),
    ))
}

fn classify_reqwest_error(error: reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::BackendTransient {
            message: format!("timeout: {error}"),
            retry_after_secs: None,
        }
    } else if error.is_connect() {
        GatewayError::BackendTransient {
            message: format!("connect: {error}"),
            retry_after_secs: None,
        }
    } else {
        GatewayError::Backend {
            message: format!("request failed: {error}"),
        }
    }
}

/// 429 and 5xx (except 501) are transient; everything else 4xx-ish is a
/// deterministic rejection.
fn classify_status(status: u16, retry_after_secs: Option<u64>, body: String) -> GatewayError {
    match status {
        429 => GatewayError::BackendTransient {
            message: format!("status 429: {body}"),
            retry_after_secs,
        },
        501 => GatewayError::BackendRejected {
            status,
            message: body,
        },
        500..=599 => GatewayError::BackendTransient {
            message: format!("status {status}: {body}"),
            retry_after_secs,
        },
        _ => GatewayError::BackendRejected {
            status,
            message: body,
        },
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
