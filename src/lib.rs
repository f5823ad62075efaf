//! agentgate: an LLM request gateway for agent simulation workloads.
//!
//! Sits between many concurrent clients and a local text-generation host,
//! turning independent generation requests into a deduplicated, rate-limited
//! stream of backend calls with caching, batching and metrics.

pub mod admission;
pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
mod error;
pub mod fingerprint;
pub mod http;
pub mod limits;
pub mod metrics;
pub mod pipeline;
pub mod prompt;
pub mod router;
pub mod single_flight;
pub mod store;
pub mod types;
pub mod util;

pub use admission::{Admission, ApiKeyConfig, QuotaIdentity, DEV_API_KEY};
pub use backend::{
    Backend, BackendHealth, ChatOptions, GenerateOptions, GenerationResult, OllamaBackend,
    RetrySettings, RetryingBackend,
};
pub use batch::{BatchCoordinator, BatchSettings};
pub use cache::{CacheLookup, CacheSettings, CachedCompletion, ResponseCache};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use fingerprint::{Fingerprint, Fingerprinter};
pub use http::{router, GatewayHttpState};
pub use limits::{RateConfig, RateLimiter};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{Pipeline, PipelineSettings};
pub use router::{ModelHealth, ModelRecord, ModelRouter};
pub use store::{CacheStore, MemoryStore};
pub use types::{
    AgentProfile, CachePolicy, CacheStatus, ChatMessage, ChatReply, ChatRequest, GenerateReply,
    GenerationRequest, MentalState, PersonalityTraits, TokenUsage,
};
pub use util::{Clock, SystemClock};
