use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::admission::QuotaIdentity;
use crate::error::{GatewayError, Result};
use crate::limits::RateLimiter;
use crate::pipeline::Pipeline;
use crate::types::{GenerateReply, GenerationRequest};

#[derive(Clone, Copy, Debug)]
pub struct BatchSettings {
    pub max_concurrency: usize,
    pub batch_deadline: Option<Duration>,
    pub max_tokens_ceiling: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            batch_deadline: None,
            max_tokens_ceiling: 2000,
        }
    }
}

/// Fans a batch of independent requests through the pipeline under a shared
/// concurrency cap. Outputs are in input order; each slot is an independent
/// success-or-failure record and nothing is ever dropped.
pub struct BatchCoordinator {
    pipeline: Arc<Pipeline>,
    semaphore: Arc<Semaphore>,
    settings: BatchSettings,
}

impl BatchCoordinator {
    pub fn new(pipeline: Arc<Pipeline>, settings: BatchSettings) -> Self {
        Self {
            pipeline,
            semaphore: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            settings,
        }
    }

    pub async fn run(
        &self,
        identity: &QuotaIdentity,
        limiter: &RateLimiter,
        requests: Vec<GenerationRequest>,
    ) -> Vec<Result<GenerateReply>> {
        let metrics = Arc::clone(self.pipeline.metrics());
        metrics.record_batch().await;

        let deadline = self.settings.batch_deadline.map(|d| Instant::now() + d);

        let items = requests.into_iter().map(|request| {
            let pipeline = Arc::clone(&self.pipeline);
            let semaphore = Arc::clone(&self.semaphore);
            let metrics = Arc::clone(&metrics);
            let ceiling = self.settings.max_tokens_ceiling;
            async move {
                let model_label = request.model.clone();
                let run = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| GatewayError::internal("batch semaphore closed"))?;
                    limiter.check(&identity.id, identity.rate).await?;
                    request.validate(ceiling)?;
                    pipeline.generate(request).await
                };

                let outcome = match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            Err(GatewayError::Timeout { stage: "batch" })
                        } else {
                            match tokio::time::timeout(remaining, run).await {
                                Ok(outcome) => outcome,
                                Err(_) => Err(GatewayError::Timeout { stage: "batch" }),
                            }
                        }
                    }
                    None => run.await,
                };

                if let Err(error) = &outcome {
                    match error {
                        GatewayError::RateLimited { .. } => {
                            metrics.record_rate_limited().await;
                            metrics.record_request(&model_label, error.code()).await;
                        }
                        GatewayError::Validation { .. } => {
                            metrics.record_request(&model_label, error.code()).await;
                        }
                        GatewayError::Timeout { stage } if *stage == "batch" => {
                            metrics.record_timeout("batch").await;
                            metrics.record_request(&model_label, error.code()).await;
                        }
                        // Everything else was already recorded by the pipeline.
                        _ => {}
                    }
                }
                outcome
            }
        });

        join_all(items).await
    }
}
