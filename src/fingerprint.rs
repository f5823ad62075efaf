use std::fmt;

use sha2::{Digest, Sha256};

use crate::types::{AgentProfile, ChatRequest, GenerationRequest};

/// 256-bit digest over the canonical serialization of a request's
/// generation-affecting fields. Used as the cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Computes fingerprints under one serialization schema version. Any change
/// to the byte layout below, or to prompt assembly, requires bumping the
/// configured schema version so stale cache entries become unreachable.
#[derive(Clone, Debug)]
pub struct Fingerprinter {
    schema_version: u32,
    extra_state_keys: Vec<String>,
}

// Domain tags keep generate and chat digests disjoint even for equal field
// bytes.
const TAG_GENERATE: u8 = b'g';
const TAG_CHAT: u8 = b'c';

impl Fingerprinter {
    pub fn new(schema_version: u32, mut extra_state_keys: Vec<String>) -> Self {
        extra_state_keys.sort();
        extra_state_keys.dedup();
        Self {
            schema_version,
            extra_state_keys,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    /// Fingerprint of a generation request. `request_id` and `cache_policy`
    /// are deliberately excluded; defaults are applied first so an explicit
    /// `temperature: 0.7` and an omitted one hash identically.
    pub fn generation(&self, request: &GenerationRequest) -> Fingerprint {
        let mut enc = Encoder::new(self.schema_version, TAG_GENERATE);
        enc.str(&request.model);
        enc.str(&request.prompt);
        let decoding = request.decoding();
        enc.real(decoding.temperature);
        enc.real(decoding.top_p);
        enc.u32(decoding.top_k);
        enc.real(decoding.repeat_penalty);
        enc.u32(decoding.max_tokens);
        enc.u32(request.stop.len() as u32);
        for stop in &request.stop {
            enc.str(stop);
        }
        enc.opt_i64(request.seed);
        self.profile(&mut enc, request.agent_profile.as_ref());
        enc.finish()
    }

    /// Fingerprint of a chat request: the ordered message list stands in for
    /// the prompt.
    pub fn chat(&self, request: &ChatRequest) -> Fingerprint {
        let mut enc = Encoder::new(self.schema_version, TAG_CHAT);
        enc.str(&request.model);
        enc.u32(request.messages.len() as u32);
        for message in &request.messages {
            enc.str(&message.role);
            enc.str(&message.content);
        }
        enc.real(request.effective_temperature());
        enc.u32(request.effective_max_tokens());
        self.profile(&mut enc, request.agent_profile.as_ref());
        enc.finish()
    }

    fn profile(&self, enc: &mut Encoder, profile: Option<&AgentProfile>) {
        let Some(profile) = profile else {
            enc.byte(0);
            return;
        };
        enc.byte(1);
        enc.i64(profile.agent_id);
        enc.str(&profile.name);
        enc.u32(profile.age);
        enc.str(&profile.occupation);
        // Presence byte per trait, canonical order. Absence must hash
        // differently from any concrete value.
        for value in [
            profile.personality.openness,
            profile.personality.conscientiousness,
            profile.personality.extraversion,
            profile.personality.agreeableness,
            profile.personality.neuroticism,
        ] {
            enc.opt_real(value);
        }
        enc.opt_real(profile.mental_state.stress_level);
        enc.opt_real(profile.mental_state.life_satisfaction);
        enc.opt_str(profile.mental_state.current_emotion.as_deref());
        let extras: Vec<(&str, &serde_json::Value)> = profile
            .mental_state
            .recognized_extra(&self.extra_state_keys)
            .collect();
        enc.u32(extras.len() as u32);
        for (key, value) in extras {
            enc.str(key);
            enc.str(&canonical_value(value));
        }
        enc.opt_str(profile.context.as_deref());
    }
}

/// Stable textual form for extension values; reals are quantized the same
/// way as first-class fields.
fn canonical_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(real) => quantize(real).to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Six-decimal quantization so float formatting drift cannot split cache
/// entries.
fn quantize(value: f64) -> i64 {
    (value * 1_000_000.0).round() as i64
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn new(schema_version: u32, tag: u8) -> Self {
        let mut enc = Self {
            buf: Vec::with_capacity(256),
        };
        enc.u32(schema_version);
        enc.byte(tag);
        enc
    }

    fn byte(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn real(&mut self, value: f64) {
        self.i64(quantize(value));
    }

    fn str(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    fn opt_real(&mut self, value: Option<f64>) {
        match value {
            Some(value) => {
                self.byte(1);
                self.real(value);
            }
            None => self.byte(0),
        }
    }

    fn opt_str(&mut self, value: Option<&str>) {
        match value {
            Some(value) => {
                self.byte(1);
                self.str(value);
            }
            None => self.byte(0),
        }
    }

    fn opt_i64(&mut self, value: Option<i64>) {
        match value {
            Some(value) => {
                self.byte(1);
                self.i64(value);
            }
            None => self.byte(0),
        }
    }

    fn finish(self) -> Fingerprint {
        let digest = Sha256::digest(&self.buf);
        Fingerprint(digest.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::testing::{minimal_request, sample_profile};
    use crate::types::{CachePolicy, ChatMessage, DEFAULT_TEMPERATURE};

    fn fingerprinter() -> Fingerprinter {
        Fingerprinter::new(1, Vec::new())
    }

    #[test]
    fn identical_requests_hash_identically() {
        let fp = fingerprinter();
        let a = minimal_request("mistral:7b", "hello");
        let b = minimal_request("mistral:7b", "hello");
        assert_eq!(fp.generation(&a), fp.generation(&b));
    }

    #[test]
    fn request_id_and_cache_policy_do_not_participate() {
        let fp = fingerprinter();
        let base = minimal_request("m", "hello");
        let mut other = base.clone();
        other.request_id = Some("req-42".to_string());
        other.cache_policy = CachePolicy::Refresh;
        assert_eq!(fp.generation(&base), fp.generation(&other));
    }

    #[test]
    fn explicit_default_equals_omitted() {
        let fp = fingerprinter();
        let base = minimal_request("m", "hello");
        let mut explicit = base.clone();
        explicit.temperature = Some(DEFAULT_TEMPERATURE);
        assert_eq!(fp.generation(&base), fp.generation(&explicit));
    }

    #[test]
    fn generation_affecting_fields_change_the_digest() {
        let fp = fingerprinter();
        let base = minimal_request("m", "hello");
        let base_fp = fp.generation(&base);

        let mut seeded = base.clone();
        seeded.seed = Some(42);
        assert_ne!(base_fp, fp.generation(&seeded));

        let mut stopped = base.clone();
        stopped.stop = vec!["\n".to_string()];
        assert_ne!(base_fp, fp.generation(&stopped));

        let mut longer = base.clone();
        longer.max_tokens = Some(400);
        assert_ne!(base_fp, fp.generation(&longer));
    }

    #[test]
    fn stop_order_matters() {
        let fp = fingerprinter();
        let mut a = minimal_request("m", "hello");
        a.stop = vec!["x".to_string(), "y".to_string()];
        let mut b = minimal_request("m", "hello");
        b.stop = vec!["y".to_string(), "x".to_string()];
        assert_ne!(fp.generation(&a), fp.generation(&b));
    }

    #[test]
    fn personality_hundredth_changes_the_digest() {
        let fp = fingerprinter();
        let mut a = minimal_request("m", "hello");
        let mut profile = sample_profile();
        profile.personality.openness = Some(0.80);
        a.agent_profile = Some(profile.clone());

        let mut b = a.clone();
        profile.personality.openness = Some(0.81);
        b.agent_profile = Some(profile);

        assert_ne!(fp.generation(&a), fp.generation(&b));
    }

    #[test]
    fn absent_trait_differs_from_any_value() {
        let fp = fingerprinter();
        let mut absent = minimal_request("m", "hello");
        let mut profile = sample_profile();
        profile.personality.extraversion = None;
        absent.agent_profile = Some(profile.clone());

        let mut midpoint = absent.clone();
        profile.personality.extraversion = Some(0.5);
        midpoint.agent_profile = Some(profile);

        assert_ne!(fp.generation(&absent), fp.generation(&midpoint));
    }

    #[test]
    fn quantization_absorbs_representation_drift() {
        let fp = fingerprinter();
        let mut a = minimal_request("m", "hello");
        a.temperature = Some(0.7);
        let mut b = minimal_request("m", "hello");
        b.temperature = Some(0.700_000_000_1);
        assert_eq!(fp.generation(&a), fp.generation(&b));
    }

    #[test]
    fn schema_version_invalidates_everything() {
        let v1 = Fingerprinter::new(1, Vec::new());
        let v2 = Fingerprinter::new(2, Vec::new());
        let request = minimal_request("m", "hello");
        assert_ne!(v1.generation(&request), v2.generation(&request));
    }

    #[test]
    fn unrecognized_extra_state_keys_are_ignored() {
        let plain = Fingerprinter::new(1, Vec::new());
        let recognizing = Fingerprinter::new(1, vec!["energy_level".to_string()]);

        let mut request = minimal_request("m", "hello");
        let mut profile = sample_profile();
        profile
            .mental_state
            .extra
            .insert("energy_level".to_string(), serde_json::json!(0.9));
        request.agent_profile = Some(profile);

        let bare = minimal_request("m", "hello");
        let mut bare_profiled = bare.clone();
        let mut plain_profile = sample_profile();
        plain_profile.mental_state.extra.clear();
        bare_profiled.agent_profile = Some(plain_profile);

        // Without recognition the extra key is invisible.
        assert_eq!(
            plain.generation(&request),
            plain.generation(&bare_profiled)
        );
        // With recognition it participates.
        assert_ne!(
            recognizing.generation(&request),
            recognizing.generation(&bare_profiled)
        );
    }

    #[test]
    fn chat_and_generate_domains_are_disjoint() {
        let fp = fingerprinter();
        let generate = minimal_request("m", "hello");
        let chat = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: "hello".to_string(),
            }],
            temperature: None,
            max_tokens: None,
            agent_profile: None,
            cache_policy: CachePolicy::default(),
            request_id: None,
        };
        assert_ne!(fp.generation(&generate), fp.chat(&chat));
    }

    #[test]
    fn hex_rendering_is_64_chars() {
        let fp = fingerprinter().generation(&minimal_request("m", "hello"));
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
