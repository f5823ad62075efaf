//! Deterministic prompt assembly from agent profiles.
//!
//! The assembled text contributes to fingerprint stability: the same user
//! prompt and profile must always produce the same bytes. Absent fields are
//! omitted entirely; no synthesized defaults appear in the output.

use crate::types::{AgentProfile, ChatMessage};

const SECTION_DELIMITER: &str = "---";
const PROMPT_MARKER: &str = "===";

/// Compose the final prompt sent to the backend. Without a profile the user
/// prompt passes through unchanged.
pub fn assemble_prompt(
    user_prompt: &str,
    profile: Option<&AgentProfile>,
    extra_state_keys: &[String],
    max_chars: usize,
) -> String {
    let Some(profile) = profile else {
        return user_prompt.to_string();
    };

    // +1 for the newline after the marker line.
    let reserved = user_prompt.chars().count() + PROMPT_MARKER.len() + 1;
    let budget = max_chars.saturating_sub(reserved);
    let header = persona_header(profile, extra_state_keys, budget);
    format!("{header}\n{PROMPT_MARKER}\n{user_prompt}")
}

/// System message prepended to chat conversations when a profile is present.
pub fn chat_system_message(
    profile: &AgentProfile,
    extra_state_keys: &[String],
    max_chars: usize,
) -> ChatMessage {
    let guidance = "Respond naturally based on your personality and current state.";
    let budget = max_chars.saturating_sub(guidance.chars().count() + 1);
    let header = persona_header(profile, extra_state_keys, budget);
    ChatMessage::system(format!("{header}\n{guidance}"))
}

/// Persona header: identity line, then personality, mental-state and context
/// sections separated by fixed delimiter lines. Only supplied fields appear.
///
/// When the header exceeds `max_chars` the context is truncated first, then
/// dropped, then the state and personality listings; the identity line is
/// never removed.
fn persona_header(profile: &AgentProfile, extra_state_keys: &[String], max_chars: usize) -> String {
    let full_context = profile.context.as_deref().unwrap_or("");

    let build = |include_personality: bool, include_state: bool, context: Option<&str>| {
        render_header(
            profile,
            extra_state_keys,
            include_personality,
            include_state,
            context,
        )
    };

    let context = profile.context.as_deref();
    let header = build(true, true, context);
    if header.chars().count() <= max_chars {
        return header;
    }

    if let Some(context) = context {
        let overflow = header.chars().count() - max_chars;
        let keep = full_context.chars().count().saturating_sub(overflow);
        if keep > 0 {
            let truncated: String = context.chars().take(keep).collect();
            let header = build(true, true, Some(&truncated));
            if header.chars().count() <= max_chars {
                return header;
            }
        }
        let header = build(true, true, None);
        if header.chars().count() <= max_chars {
            return header;
        }
    }

    let header = build(true, false, None);
    if header.chars().count() <= max_chars {
        return header;
    }
    build(false, false, None)
}

fn render_header(
    profile: &AgentProfile,
    extra_state_keys: &[String],
    include_personality: bool,
    include_state: bool,
    context: Option<&str>,
) -> String {
    let mut sections = vec![format!(
        "You are {}, a {}-year-old {}.",
        profile.name, profile.age, profile.occupation
    )];

    if include_personality && !profile.personality.is_empty() {
        let mut lines = vec!["Personality traits:".to_string()];
        for (name, value) in profile.personality.present() {
            lines.push(format!("- {}: {:.2}", title_case(name), value));
        }
        sections.push(lines.join("\n"));
    }

    if include_state && !profile.mental_state.is_empty() {
        let mut lines = vec!["Current state:".to_string()];
        if let Some(stress) = profile.mental_state.stress_level {
            lines.push(format!("- Stress level: {stress:.2}"));
        }
        if let Some(satisfaction) = profile.mental_state.life_satisfaction {
            lines.push(format!("- Life satisfaction: {satisfaction:.2}"));
        }
        if let Some(emotion) = &profile.mental_state.current_emotion {
            lines.push(format!("- Current emotion: {emotion}"));
        }
        for (key, value) in profile.mental_state.recognized_extra(extra_state_keys) {
            lines.push(format!("- {}: {}", title_case(key), render_value(value)));
        }
        if lines.len() > 1 {
            sections.push(lines.join("\n"));
        }
    }

    if let Some(context) = context {
        if !context.is_empty() {
            sections.push(format!("Context: {context}"));
        }
    }

    sections.join(&format!("\n{SECTION_DELIMITER}\n"))
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => match n.as_f64() {
            Some(real) => format!("{real:.2}"),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

fn title_case(key: &str) -> String {
    let spaced = key.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => spaced,
    }
}
