use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Canonical ordering of the Big Five trait names. Fingerprinting and prompt
/// assembly both iterate in this order.
pub const PERSONALITY_TRAIT_NAMES: [&str; 5] = [
    "openness",
    "conscientiousness",
    "extraversion",
    "agreeableness",
    "neuroticism",
];

/// Decoding defaults applied when a request omits a control. These are the
/// effective values that enter the fingerprint.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 200;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_TOP_K: u32 = 40;
pub const DEFAULT_REPEAT_PENALTY: f64 = 1.1;

/// Big Five trait values. Absent means "not specified", never 0.5.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalityTraits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conscientiousness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraversion: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agreeableness: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neuroticism: Option<f64>,
}

impl PersonalityTraits {
    /// Present traits in canonical order.
    pub fn present(&self) -> Vec<(&'static str, f64)> {
        let values = [
            self.openness,
            self.conscientiousness,
            self.extraversion,
            self.agreeableness,
            self.neuroticism,
        ];
        PERSONALITY_TRAIT_NAMES
            .iter()
            .zip(values)
            .filter_map(|(name, value)| value.map(|v| (*name, v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.present().is_empty()
    }
}

/// Mental-state fields. The named trio is the conservatively recognized set;
/// everything else lands in `extra` and only participates when the gateway is
/// configured to recognize the key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MentalState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub life_satisfaction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_emotion: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl MentalState {
    pub fn is_empty(&self) -> bool {
        self.stress_level.is_none()
            && self.life_satisfaction.is_none()
            && self.current_emotion.is_none()
            && self.extra.is_empty()
    }

    /// Extra fields that the gateway is configured to recognize, in sorted
    /// key order. `extra` is a BTreeMap so iteration order is already stable.
    pub fn recognized_extra<'a>(
        &'a self,
        recognized_keys: &'a [String],
    ) -> impl Iterator<Item = (&'a str, &'a serde_json::Value)> + 'a {
        self.extra
            .iter()
            .filter(|(key, _)| recognized_keys.iter().any(|k| k == *key))
            .map(|(key, value)| (key.as_str(), value))
    }
}

/// Speaker description attached to a request. Participates in the fingerprint
/// and in prompt assembly; never forwarded to the backend as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: i64,
    pub name: String,
    pub age: u32,
    pub occupation: String,
    #[serde(default)]
    pub personality: PersonalityTraits,
    #[serde(default)]
    pub mental_state: MentalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    #[default]
    Use,
    Bypass,
    Refresh,
}

/// Reported on every successful response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Refresh,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Refresh => "refresh",
            CacheStatus::Bypass => "bypass",
        }
    }
}

/// A single text-generation request, immutable after admission.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_profile: Option<AgentProfile>,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Effective decoding controls after defaults are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodingParams {
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub top_k: u32,
    pub repeat_penalty: f64,
}

impl GenerationRequest {
    pub fn decoding(&self) -> DecodingParams {
        DecodingParams {
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            top_k: self.top_k.unwrap_or(DEFAULT_TOP_K),
            repeat_penalty: self.repeat_penalty.unwrap_or(DEFAULT_REPEAT_PENALTY),
        }
    }

    pub fn validate(&self, max_tokens_ceiling: u32) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("model must not be empty"));
        }
        if self.prompt.is_empty() {
            return Err(GatewayError::validation("prompt must not be empty"));
        }
        let decoding = self.decoding();
        if !(0.0..=2.0).contains(&decoding.temperature) {
            return Err(GatewayError::validation("temperature must be in [0, 2]"));
        }
        if !(0.0..=1.0).contains(&decoding.top_p) {
            return Err(GatewayError::validation("top_p must be in [0, 1]"));
        }
        if decoding.top_k == 0 {
            return Err(GatewayError::validation("top_k must be at least 1"));
        }
        if decoding.repeat_penalty <= 0.0 {
            return Err(GatewayError::validation("repeat_penalty must be positive"));
        }
        if decoding.max_tokens == 0 || decoding.max_tokens > max_tokens_ceiling {
            return Err(GatewayError::validation(format!(
                "max_tokens must be in [1, {max_tokens_ceiling}]"
            )));
        }
        if let Some(profile) = &self.agent_profile {
            validate_profile(profile)?;
        }
        Ok(())
    }
}

/// One turn of a chat exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Chat completion request. Flows through the same cache and single-flight
/// machinery as plain generation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_profile: Option<AgentProfile>,
    #[serde(default)]
    pub cache_policy: CachePolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ChatRequest {
    pub fn effective_temperature(&self) -> f64 {
        self.temperature.unwrap_or(DEFAULT_TEMPERATURE)
    }

    pub fn effective_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn validate(&self, max_tokens_ceiling: u32) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation("model must not be empty"));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::validation("messages must not be empty"));
        }
        for message in &self.messages {
            if !matches!(message.role.as_str(), "system" | "user" | "assistant") {
                return Err(GatewayError::validation(format!(
                    "unknown message role: {}",
                    message.role
                )));
            }
            if message.content.is_empty() {
                return Err(GatewayError::validation("message content must not be empty"));
            }
        }
        if !(0.0..=2.0).contains(&self.effective_temperature()) {
            return Err(GatewayError::validation("temperature must be in [0, 2]"));
        }
        let max_tokens = self.effective_max_tokens();
        if max_tokens == 0 || max_tokens > max_tokens_ceiling {
            return Err(GatewayError::validation(format!(
                "max_tokens must be in [1, {max_tokens_ceiling}]"
            )));
        }
        if let Some(profile) = &self.agent_profile {
            validate_profile(profile)?;
        }
        Ok(())
    }
}

const MAX_CONTEXT_CHARS: usize = 8192;

fn validate_profile(profile: &AgentProfile) -> Result<()> {
    if profile.name.trim().is_empty() {
        return Err(GatewayError::validation("agent name must not be empty"));
    }
    for (name, value) in profile.personality.present() {
        if !(0.0..=1.0).contains(&value) {
            return Err(GatewayError::validation(format!(
                "personality.{name} must be in [0, 1]"
            )));
        }
    }
    for (name, value) in [
        ("stress_level", profile.mental_state.stress_level),
        ("life_satisfaction", profile.mental_state.life_satisfaction),
    ] {
        if let Some(value) = value {
            if !(0.0..=1.0).contains(&value) {
                return Err(GatewayError::validation(format!(
                    "mental_state.{name} must be in [0, 1]"
                )));
            }
        }
    }
    if let Some(context) = &profile.context {
        if context.chars().count() > MAX_CONTEXT_CHARS {
            return Err(GatewayError::validation(format!(
                "profile context exceeds {MAX_CONTEXT_CHARS} characters"
            )));
        }
    }
    Ok(())
}

/// Prompt/completion token counts. The backend may not report them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: Option<u64>,
    pub completion: Option<u64>,
}

/// Successful `/generate` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateReply {
    pub response: String,
    pub model: String,
    pub cache_status: CacheStatus,
    pub latency_ms: u64,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Successful `/chat` response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatReply {
    pub message: ChatMessage,
    pub model: String,
    pub cache_status: CacheStatus,
    pub latency_ms: u64,
    pub tokens: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn minimal_request(model: &str, prompt: &str) -> GenerationRequest {
        GenerationRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            stop: Vec::new(),
            seed: None,
            agent_profile: None,
            cache_policy: CachePolicy::default(),
            request_id: None,
        }
    }

    pub(crate) fn sample_profile() -> AgentProfile {
        AgentProfile {
            agent_id: 7,
            name: "Ada".to_string(),
            age: 36,
            occupation: "engineer".to_string(),
            personality: PersonalityTraits {
                openness: Some(0.8),
                conscientiousness: Some(0.6),
                ..PersonalityTraits::default()
            },
            mental_state: MentalState {
                stress_level: Some(0.3),
                life_satisfaction: Some(0.7),
                current_emotion: Some("calm".to_string()),
                extra: BTreeMap::new(),
            },
            context: Some("Preparing a design review.".to_string()),
        }
    }
}
