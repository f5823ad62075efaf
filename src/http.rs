use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::admission::{Admission, QuotaIdentity};
use crate::backend::{Backend, BackendHealth};
use crate::batch::BatchCoordinator;
use crate::error::GatewayError;
use crate::limits::RateLimiter;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::router::{ModelRecord, ModelRouter};
use crate::types::{ChatReply, ChatRequest, GenerateReply, GenerationRequest};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    admission: Arc<Admission>,
    limiter: Arc<RateLimiter>,
    pipeline: Arc<Pipeline>,
    batch: Arc<BatchCoordinator>,
    models: Arc<ModelRouter>,
    backend: Arc<dyn Backend>,
    metrics: Arc<Metrics>,
    max_tokens_ceiling: u32,
}

impl GatewayHttpState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        admission: Arc<Admission>,
        limiter: Arc<RateLimiter>,
        pipeline: Arc<Pipeline>,
        batch: Arc<BatchCoordinator>,
        models: Arc<ModelRouter>,
        backend: Arc<dyn Backend>,
        metrics: Arc<Metrics>,
        max_tokens_ceiling: u32,
    ) -> Self {
        Self {
            admission,
            limiter,
            pipeline,
            batch,
            models,
            backend,
            metrics,
            max_tokens_ceiling,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct BatchGenerateRequest {
    pub requests: Vec<GenerationRequest>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum BatchItem {
    Ok(Box<GenerateReply>),
    Err { error: ErrorDetail },
}

#[derive(Debug, Serialize)]
struct BatchGenerateResponse {
    responses: Vec<BatchItem>,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<ModelRecord>,
    refreshed_at_ms: u64,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/generate", post(handle_generate))
        .route("/chat", post(handle_chat))
        .route("/batch/generate", post(handle_batch_generate))
        .route("/models", get(handle_models))
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.to_string(),
                retry_after: None,
            },
        }),
    )
}

fn error_detail(error: &GatewayError) -> ErrorDetail {
    ErrorDetail {
        code: error.code(),
        message: error.to_string(),
        retry_after: error.retry_after().map(|d| d.as_secs()),
    }
}

fn map_gateway_error(error: GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &error {
        GatewayError::Validation { .. } => StatusCode::BAD_REQUEST,
        GatewayError::Unauthorized => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::ModelUnavailable { .. } => StatusCode::NOT_FOUND,
        GatewayError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
        GatewayError::BackendTransient { .. }
        | GatewayError::BackendRejected { .. }
        | GatewayError::Backend { .. } => StatusCode::BAD_GATEWAY,
        GatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error_detail(&error),
        }),
    )
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn generate_request_id() -> String {
    format!("req-{}", REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// Admission and rate limiting, shared by every generation endpoint.
async fn admit(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    model_label: &str,
) -> Result<QuotaIdentity, (StatusCode, Json<ErrorResponse>)> {
    let presented = extract_header(headers, "x-api-key");
    let identity = match state.admission.authorize(presented.as_deref()) {
        Ok(identity) => identity,
        Err(error) => {
            state.metrics.record_request(model_label, error.code()).await;
            return Err(map_gateway_error(error));
        }
    };
    if let Err(error) = state.limiter.check(&identity.id, identity.rate).await {
        state.metrics.record_rate_limited().await;
        state.metrics.record_request(model_label, error.code()).await;
        return Err(map_gateway_error(error));
    }
    Ok(identity)
}

async fn handle_generate(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(mut request): Json<GenerationRequest>,
) -> Result<Json<GenerateReply>, (StatusCode, Json<ErrorResponse>)> {
    admit(&state, &headers, &request.model).await?;

    if let Err(error) = request.validate(state.max_tokens_ceiling) {
        state
            .metrics
            .record_request(&request.model, error.code())
            .await;
        return Err(map_gateway_error(error));
    }

    if request.request_id.is_none() {
        request.request_id = Some(generate_request_id());
    }

    state
        .pipeline
        .generate(request)
        .await
        .map(Json)
        .map_err(map_gateway_error)
}

async fn handle_chat(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(mut request): Json<ChatRequest>,
) -> Result<Json<ChatReply>, (StatusCode, Json<ErrorResponse>)> {
    admit(&state, &headers, &request.model).await?;

    if let Err(error) = request.validate(state.max_tokens_ceiling) {
        state
            .metrics
            .record_request(&request.model, error.code())
            .await;
        return Err(map_gateway_error(error));
    }

    if request.request_id.is_none() {
        request.request_id = Some(generate_request_id());
    }

    state
        .pipeline
        .chat(request)
        .await
        .map(Json)
        .map_err(map_gateway_error)
}

async fn handle_batch_generate(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Json(mut batch): Json<BatchGenerateRequest>,
) -> Result<Json<BatchGenerateResponse>, (StatusCode, Json<ErrorResponse>)> {
    // The batch itself is admitted once; each item is then rate-limited and
    // validated independently so no slot is silently dropped.
    let presented = extract_header(&headers, "x-api-key");
    let identity = state
        .admission
        .authorize(presented.as_deref())
        .map_err(map_gateway_error)?;

    for request in &mut batch.requests {
        if request.request_id.is_none() {
            request.request_id = Some(generate_request_id());
        }
    }

    let outcomes = state
        .batch
        .run(&identity, &state.limiter, batch.requests)
        .await;

    let responses = outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(reply) => BatchItem::Ok(Box::new(reply)),
            Err(error) => BatchItem::Err {
                error: error_detail(&error),
            },
        })
        .collect();

    Ok(Json(BatchGenerateResponse { responses }))
}

async fn handle_models(
    State(state): State<GatewayHttpState>,
) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.models.records().await,
        refreshed_at_ms: state.models.refreshed_at_ms().await,
    })
}

async fn handle_health() -> Json<StatusResponse> {
    Json(StatusResponse { status: "ok" })
}

async fn handle_ready(
    State(state): State<GatewayHttpState>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    if state.backend.health().await != BackendHealth::Ok {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "backend unavailable",
        ));
    }
    if !state.models.any_ready().await {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "not_ready",
            "no model resolves",
        ));
    }
    Ok(Json(StatusResponse { status: "ready" }))
}

async fn handle_metrics(State(state): State<GatewayHttpState>) -> (StatusCode, HeaderMap, String) {
    let rendered = state.metrics.render().await;
    let mut headers = HeaderMap::new();
    headers.insert(
        "content-type",
        "text/plain; version=0.0.4"
            .parse()
            .unwrap_or_else(|_| axum::http::HeaderValue::from_static("text/plain")),
    );
    (StatusCode::OK, headers, rendered)
}
