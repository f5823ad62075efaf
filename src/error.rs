use std::time::Duration;

use thiserror::Error;

/// Gateway error taxonomy. Every variant carries owned data so outcomes can
/// be cloned into each waiter of a coalesced computation.
#[derive(Clone, Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {reason}")]
    Validation { reason: String },
    #[error("invalid or missing api key")]
    Unauthorized,
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("model unavailable: {model}")]
    ModelUnavailable { model: String },
    #[error("backend transient failure: {message}")]
    BackendTransient {
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("backend rejected request ({status}): {message}")]
    BackendRejected { status: u16, message: String },
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("deadline exceeded in {stage}")]
    Timeout { stage: &'static str },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        GatewayError::Validation {
            reason: reason.into(),
        }
    }

    /// Transient failures are the only retryable category. Retries happen in
    /// the backend client; everything above it sees the exhausted form.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::BackendTransient { .. })
    }

    /// Deterministic failures may be negative-cached; transient ones never.
    pub fn is_negative_cacheable(&self) -> bool {
        matches!(self, GatewayError::BackendRejected { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => {
                Some(Duration::from_secs(*retry_after_secs))
            }
            GatewayError::BackendTransient {
                retry_after_secs: Some(secs),
                ..
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Wire-level error kind, also used as the metrics outcome label.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "validation",
            GatewayError::Unauthorized => "unauthorized",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::ModelUnavailable { .. } => "model_unavailable",
            GatewayError::BackendTransient { .. }
            | GatewayError::BackendRejected { .. }
            | GatewayError::Backend { .. } => "backend_error",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Internal { .. } => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let transient = GatewayError::BackendTransient {
            message: "connect refused".to_string(),
            retry_after_secs: None,
        };
        assert!(transient.is_transient());
        assert!(!transient.is_negative_cacheable());

        let rejected = GatewayError::BackendRejected {
            status: 400,
            message: "bad prompt".to_string(),
        };
        assert!(!rejected.is_transient());
        assert!(rejected.is_negative_cacheable());
    }

    #[test]
    fn retry_after_surfaces_hints() {
        let limited = GatewayError::RateLimited { retry_after_secs: 3 };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));

        let backend = GatewayError::BackendTransient {
            message: "429".to_string(),
            retry_after_secs: Some(7),
        };
        assert_eq!(backend.retry_after(), Some(Duration::from_secs(7)));

        assert_eq!(GatewayError::Unauthorized.retry_after(), None);
    }

    #[test]
    fn backend_variants_share_a_wire_code() {
        let exhausted = GatewayError::Backend {
            message: "out of retries".to_string(),
        };
        let rejected = GatewayError::BackendRejected {
            status: 422,
            message: "nope".to_string(),
        };
        assert_eq!(exhausted.code(), "backend_error");
        assert_eq!(rejected.code(), "backend_error");
    }
}
