use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use agentgate::{
    Backend, BackendHealth, CachePolicy, CacheSettings, CacheStore, ChatOptions, Clock,
    GatewayError, GenerateOptions, GenerationRequest, GenerationResult, MemoryStore, Metrics,
    ModelRouter, Pipeline, PipelineSettings, ResponseCache, Result, RetrySettings,
    RetryingBackend, SystemClock,
};

/// Backend stub with a synthetic per-call delay and an optional run of
/// transient failures before the first success.
struct SlowBackend {
    delay: Duration,
    fail_first: usize,
    generate_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowBackend {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail_first: 0,
            generate_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn flaky(fail_first: usize) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            fail_first,
            generate_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Backend for SlowBackend {
    async fn generate(
        &self,
        model: &str,
        _prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<GenerationResult> {
        let call = self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let concurrent = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(concurrent, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(GatewayError::BackendTransient {
                message: "status 503: warming up".to_string(),
                retry_after_secs: None,
            });
        }
        Ok(GenerationResult {
            text: format!("completion #{call}"),
            model: model.to_string(),
            prompt_tokens: Some(3),
            completion_tokens: Some(5),
        })
    }

    async fn chat(
        &self,
        _model: &str,
        _messages: &[agentgate::ChatMessage],
        _options: &ChatOptions,
    ) -> Result<GenerationResult> {
        unreachable!("these tests only generate");
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["mistral:7b".to_string()])
    }

    async fn health(&self) -> BackendHealth {
        BackendHealth::Ok
    }
}

async fn build_pipeline(
    backend: Arc<dyn Backend>,
    request_deadline: Duration,
) -> (Arc<Pipeline>, Arc<Metrics>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::default());
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(1024, Arc::clone(&clock)));
    let cache = Arc::new(ResponseCache::new(
        store,
        CacheSettings {
            enabled: true,
            default_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(30),
            schema_version: 1,
        },
        Arc::clone(&clock),
    ));
    let models = Arc::new(ModelRouter::new(BTreeMap::new(), clock));
    models.refresh_from(backend.as_ref()).await.unwrap();

    let pipeline = Arc::new(Pipeline::new(
        cache,
        models,
        backend,
        Arc::clone(&metrics),
        PipelineSettings {
            request_deadline,
            ..PipelineSettings::default()
        },
    ));
    (pipeline, metrics)
}

fn request(prompt: &str, policy: CachePolicy) -> GenerationRequest {
    GenerationRequest {
        model: "mistral:7b".to_string(),
        prompt: prompt.to_string(),
        temperature: None,
        max_tokens: None,
        top_p: None,
        top_k: None,
        repeat_penalty: None,
        stop: Vec::new(),
        seed: None,
        agent_profile: None,
        cache_policy: policy,
        request_id: None,
    }
}

#[tokio::test(start_paused = true)]
async fn fifty_identical_requests_coalesce_to_one_backend_call() {
    let backend = SlowBackend::new(Duration::from_millis(500));
    let (pipeline, metrics) =
        build_pipeline(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(120)).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            pipeline.generate(request("hello", CachePolicy::Use)).await
        }));
    }

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    let first = &responses[0].response;
    assert!(responses.iter().all(|reply| &reply.response == first));
    assert_eq!(metrics.snapshot().await.single_flight_coalesced, 49);
}

#[tokio::test(start_paused = true)]
async fn different_prompts_do_not_coalesce() {
    let backend = SlowBackend::new(Duration::from_millis(100));
    let (pipeline, _) =
        build_pipeline(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(120)).await;

    let a = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.generate(request("alpha", CachePolicy::Use)).await })
    };
    let b = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.generate(request("beta", CachePolicy::Use)).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_ne!(a.response, b.response);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_to_success_without_caching_them() {
    let transport = SlowBackend::flaky(2);
    let metrics = Arc::new(Metrics::default());
    let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(
        Arc::clone(&transport) as Arc<dyn Backend>,
        RetrySettings {
            max_retries: 3,
            total_deadline: Duration::from_secs(90),
        },
        Arc::clone(&metrics),
    ));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new(1024, Arc::clone(&clock)));
    let cache = Arc::new(ResponseCache::new(
        store,
        CacheSettings {
            enabled: true,
            default_ttl: Duration::from_secs(3600),
            negative_ttl: Duration::from_secs(30),
            schema_version: 1,
        },
        Arc::clone(&clock),
    ));
    let models = Arc::new(ModelRouter::new(BTreeMap::new(), clock));
    models.refresh_from(backend.as_ref()).await.unwrap();
    let pipeline = Arc::new(Pipeline::new(
        cache,
        models,
        backend,
        Arc::clone(&metrics),
        PipelineSettings::default(),
    ));

    let reply = pipeline
        .generate(request("hello", CachePolicy::Use))
        .await
        .unwrap();
    assert_eq!(reply.response, "completion #2");
    assert_eq!(transport.generate_calls.load(Ordering::SeqCst), 3);
    assert_eq!(metrics.snapshot().await.retries, 2);

    // The success, not the failures, is what got cached.
    let again = pipeline
        .generate(request("hello", CachePolicy::Use))
        .await
        .unwrap();
    assert_eq!(again.response, "completion #2");
    assert_eq!(transport.generate_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn slow_backend_trips_the_request_deadline() {
    let backend = SlowBackend::new(Duration::from_secs(600));
    let (pipeline, _) =
        build_pipeline(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(1)).await;

    let err = pipeline
        .generate(request("hello", CachePolicy::Use))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "timeout");
}

#[tokio::test(start_paused = true)]
async fn batch_bounds_in_flight_pipelines() {
    use agentgate::{BatchCoordinator, BatchSettings, QuotaIdentity, RateConfig, RateLimiter};

    let backend = SlowBackend::new(Duration::from_millis(200));
    let (pipeline, _) =
        build_pipeline(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(120)).await;
    let batch = BatchCoordinator::new(
        Arc::clone(&pipeline),
        BatchSettings {
            max_concurrency: 4,
            batch_deadline: None,
            max_tokens_ceiling: 2000,
        },
    );
    let limiter = RateLimiter::new(
        RateConfig {
            capacity: 1000.0,
            refill_per_second: 100.0,
        },
        Arc::new(SystemClock),
    );
    let identity = QuotaIdentity {
        id: "batch-test".to_string(),
        rate: None,
    };

    // Distinct prompts so nothing coalesces.
    let requests: Vec<GenerationRequest> = (0..20)
        .map(|i| {
            let mut request = request(&format!("prompt {i}"), CachePolicy::Use);
            request.request_id = Some(format!("r{i}"));
            request
        })
        .collect();
    let outcomes = batch.run(&identity, &limiter, requests).await;

    assert_eq!(outcomes.len(), 20);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 20);
    assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 4);

    // Outputs line up with inputs regardless of completion order.
    for (i, outcome) in outcomes.iter().enumerate() {
        let reply = outcome.as_ref().unwrap();
        assert_eq!(reply.request_id.as_deref(), Some(format!("r{i}").as_str()));
    }
}

#[tokio::test(start_paused = true)]
async fn refresh_coalesces_with_concurrent_use_requests() {
    let backend = SlowBackend::new(Duration::from_millis(500));
    let (pipeline, metrics) =
        build_pipeline(Arc::clone(&backend) as Arc<dyn Backend>, Duration::from_secs(120)).await;

    let refresher = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .generate(request("hello", CachePolicy::Refresh))
                .await
        })
    };
    let reader = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.generate(request("hello", CachePolicy::Use)).await })
    };

    let refreshed = refresher.await.unwrap().unwrap();
    let read = reader.await.unwrap().unwrap();
    assert_eq!(refreshed.response, read.response);
    assert_eq!(backend.generate_calls.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.snapshot().await.single_flight_coalesced, 1);
}
