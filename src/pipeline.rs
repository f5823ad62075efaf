use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backend::{Backend, ChatOptions, GenerateOptions};
use crate::cache::{CachedCompletion, ResponseCache};
use crate::error::{GatewayError, Result};
use crate::fingerprint::Fingerprinter;
use crate::metrics::Metrics;
use crate::prompt::{assemble_prompt, chat_system_message};
use crate::router::ModelRouter;
use crate::types::{
    CacheStatus, ChatMessage, ChatReply, ChatRequest, GenerateReply, GenerationRequest, TokenUsage,
};

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub schema_version: u32,
    pub cache_ttl_s: u64,
    pub request_deadline: Duration,
    pub prompt_max_chars: usize,
    pub extra_state_keys: Vec<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            schema_version: 1,
            cache_ttl_s: 3600,
            request_deadline: Duration::from_secs(120),
            prompt_max_chars: 8192,
            extra_state_keys: Vec::new(),
        }
    }
}

/// Orchestrates one admitted request: fingerprint, cache policy, coalesced
/// backend call, cache write-back, metrics. Validation and rate limiting
/// happen before a request reaches this type; retries happen below it.
pub struct Pipeline {
    fingerprinter: Fingerprinter,
    cache: Arc<ResponseCache>,
    router: Arc<ModelRouter>,
    backend: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
    cache_ttl_s: u64,
    request_deadline: Duration,
    prompt_max_chars: usize,
    extra_state_keys: Arc<Vec<String>>,
}

impl Pipeline {
    pub fn new(
        cache: Arc<ResponseCache>,
        router: Arc<ModelRouter>,
        backend: Arc<dyn Backend>,
        metrics: Arc<Metrics>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fingerprinter: Fingerprinter::new(
                settings.schema_version,
                settings.extra_state_keys.clone(),
            ),
            cache,
            router,
            backend,
            metrics,
            cache_ttl_s: settings.cache_ttl_s,
            request_deadline: settings.request_deadline,
            prompt_max_chars: settings.prompt_max_chars,
            extra_state_keys: Arc::new(settings.extra_state_keys),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerateReply> {
        let _in_flight = self.metrics.track_in_flight();
        let started = Instant::now();
        let model_label = request.model.clone();
        let request_id = request.request_id.clone();

        let outcome = match tokio::time::timeout(
            self.request_deadline,
            self.generate_inner(request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                self.metrics.record_timeout("request").await;
                Err(GatewayError::Timeout { stage: "request" })
            }
        };

        let latency = started.elapsed();
        self.metrics.observe_request_latency(latency).await;

        match outcome {
            Ok((entry, cache_status, coalesced)) => {
                self.finish_ok(&model_label, &entry, cache_status, coalesced)
                    .await;
                Ok(GenerateReply {
                    response: entry.response_text,
                    model: entry.model_used,
                    cache_status,
                    latency_ms: latency.as_millis() as u64,
                    tokens: TokenUsage {
                        prompt: entry.prompt_tokens,
                        completion: entry.completion_tokens,
                    },
                    request_id,
                })
            }
            Err(error) => {
                self.metrics
                    .record_request(&model_label, error.code())
                    .await;
                Err(error)
            }
        }
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let _in_flight = self.metrics.track_in_flight();
        let started = Instant::now();
        let model_label = request.model.clone();
        let request_id = request.request_id.clone();

        let outcome = match tokio::time::timeout(
            self.request_deadline,
            self.chat_inner(request),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                self.metrics.record_timeout("request").await;
                Err(GatewayError::Timeout { stage: "request" })
            }
        };

        let latency = started.elapsed();
        self.metrics.observe_request_latency(latency).await;

        match outcome {
            Ok((entry, cache_status, coalesced)) => {
                self.finish_ok(&model_label, &entry, cache_status, coalesced)
                    .await;
                Ok(ChatReply {
                    message: ChatMessage {
                        role: "assistant".to_string(),
                        content: entry.response_text,
                    },
                    model: entry.model_used,
                    cache_status,
                    latency_ms: latency.as_millis() as u64,
                    tokens: TokenUsage {
                        prompt: entry.prompt_tokens,
                        completion: entry.completion_tokens,
                    },
                    request_id,
                })
            }
            Err(error) => {
                self.metrics
                    .record_request(&model_label, error.code())
                    .await;
                Err(error)
            }
        }
    }

    async fn finish_ok(
        &self,
        model_label: &str,
        entry: &CachedCompletion,
        cache_status: CacheStatus,
        coalesced: bool,
    ) {
        self.metrics.record_request(model_label, "ok").await;
        self.metrics.record_cache_status(cache_status).await;
        if coalesced {
            self.metrics.record_coalesced().await;
        }
        // Tokens are accounted once per backend call: not for cache hits, and
        // not again for coalesced waiters.
        if cache_status != CacheStatus::Hit && !coalesced {
            self.metrics
                .record_tokens(
                    model_label,
                    TokenUsage {
                        prompt: entry.prompt_tokens,
                        completion: entry.completion_tokens,
                    },
                )
                .await;
        }
    }

    async fn generate_inner(
        &self,
        request: GenerationRequest,
    ) -> Result<(CachedCompletion, CacheStatus, bool)> {
        let fingerprint = self.fingerprinter.generation(&request);
        let policy = request.cache_policy;

        let router = Arc::clone(&self.router);
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let cache = Arc::clone(&self.cache);
        let extra_state_keys = Arc::clone(&self.extra_state_keys);
        let prompt_max_chars = self.prompt_max_chars;
        let cache_ttl_s = self.cache_ttl_s;
        let request = Arc::new(request);

        let compute = move || {
            let router = Arc::clone(&router);
            let backend = Arc::clone(&backend);
            let metrics = Arc::clone(&metrics);
            let cache = Arc::clone(&cache);
            let extra_state_keys = Arc::clone(&extra_state_keys);
            let request = Arc::clone(&request);
            async move {
                let backend_model = router.resolve(&request.model).await?;
                let prompt = assemble_prompt(
                    &request.prompt,
                    request.agent_profile.as_ref(),
                    &extra_state_keys,
                    prompt_max_chars,
                );
                let decoding = request.decoding();
                let options = GenerateOptions {
                    temperature: decoding.temperature,
                    top_p: decoding.top_p,
                    top_k: decoding.top_k,
                    repeat_penalty: decoding.repeat_penalty,
                    max_tokens: decoding.max_tokens,
                    stop: request.stop.clone(),
                    seed: request.seed,
                };

                let backend_started = Instant::now();
                let result = backend.generate(&backend_model, &prompt, &options).await;
                metrics.observe_backend_latency(backend_started.elapsed()).await;

                match result {
                    Ok(result) => Ok(CachedCompletion {
                        response_text: result.text,
                        model_used: result.model,
                        prompt_tokens: result.prompt_tokens,
                        completion_tokens: result.completion_tokens,
                        created_at_ms: cache.now_millis(),
                        ttl_s: cache_ttl_s,
                    }),
                    Err(error) => {
                        if matches!(error, GatewayError::Backend { .. }) {
                            router.mark_unavailable(&backend_model).await;
                        }
                        Err(error)
                    }
                }
            }
        };

        let (outcome, cache_status, coalesced) =
            self.cache.get_or_compute(fingerprint, policy, compute).await;
        outcome.map(|entry| (entry, cache_status, coalesced))
    }

    async fn chat_inner(
        &self,
        request: ChatRequest,
    ) -> Result<(CachedCompletion, CacheStatus, bool)> {
        let fingerprint = self.fingerprinter.chat(&request);
        let policy = request.cache_policy;

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(profile) = &request.agent_profile {
            messages.push(chat_system_message(
                profile,
                &self.extra_state_keys,
                self.prompt_max_chars,
            ));
        }
        messages.extend(request.messages.iter().cloned());

        let router = Arc::clone(&self.router);
        let backend = Arc::clone(&self.backend);
        let metrics = Arc::clone(&self.metrics);
        let cache = Arc::clone(&self.cache);
        let cache_ttl_s = self.cache_ttl_s;
        let messages = Arc::new(messages);
        let model = request.model.clone();
        let options = ChatOptions {
            temperature: request.effective_temperature(),
            max_tokens: request.effective_max_tokens(),
        };

        let compute = move || {
            let router = Arc::clone(&router);
            let backend = Arc::clone(&backend);
            let metrics = Arc::clone(&metrics);
            let cache = Arc::clone(&cache);
            let messages = Arc::clone(&messages);
            let model = model.clone();
            let options = options.clone();
            async move {
                let backend_model = router.resolve(&model).await?;

                let backend_started = Instant::now();
                let result = backend.chat(&backend_model, &messages, &options).await;
                metrics.observe_backend_latency(backend_started.elapsed()).await;

                match result {
                    Ok(result) => Ok(CachedCompletion {
                        response_text: result.text,
                        model_used: result.model,
                        prompt_tokens: result.prompt_tokens,
                        completion_tokens: result.completion_tokens,
                        created_at_ms: cache.now_millis(),
                        ttl_s: cache_ttl_s,
                    }),
                    Err(error) => {
                        if matches!(error, GatewayError::Backend { .. }) {
                            router.mark_unavailable(&backend_model).await;
                        }
                        Err(error)
                    }
                }
            }
        };

        let (outcome, cache_status, coalesced) =
            self.cache.get_or_compute(fingerprint, policy, compute).await;
        outcome.map(|entry| (entry, cache_status, coalesced))
    }
}
