//! The clarification turn protocol.
//!
//! On each user response the session assembles the gathered context, recent
//! messages, and a system prompt, and asks the LLM for a structured reply.
//! A reply that fails to parse is treated as plain prose: the whole text
//! becomes the assistant message and coverage does not advance.

use std::collections::BTreeMap;

use serde::Deserialize;
use swarm_adapters::{ChatMessage, CompletionRequest};
use swarm_core::Json;
use swarm_store::{Message, MessageRole, Session};

/// System prompt for the clarifier.
const CLARIFIER_SYSTEM: &str = "\
You are a project clarifier. Your job is to fill five categories of context \
before a specification can be written: project_type (kind, platform, \
audience), tech_stack (language, framework, storage), scale (users, \
availability), features (core, integrations), constraints (timeline, \
compliance).\n\
Reply with a single JSON object: {\"message\": string, \"gathered\": \
{category: {subfield: value}}, \"progress\": number, \"ready_for_spec\": \
bool, \"next_category\": string|null}. Ask about one category at a time and \
only record what the user actually said.";

/// How many recent messages accompany each clarification turn.
const HISTORY_WINDOW: usize = 12;

/// Structured clarifier reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClarifierReply {
    /// The assistant's next message to the user.
    pub message: String,
    /// Newly gathered context to merge.
    #[serde(default)]
    pub gathered: BTreeMap<String, BTreeMap<String, Json>>,
    /// Self-reported progress; advisory only.
    #[serde(default)]
    pub progress: Option<u8>,
    /// Whether the clarifier believes spec generation can start.
    #[serde(default)]
    pub ready_for_spec: bool,
    /// The category the clarifier will ask about next.
    #[serde(default)]
    pub next_category: Option<String>,
}

/// Build the completion request for one clarification turn.
#[must_use]
pub fn build_turn_request(session: &Session, history: &[Message], model: &str) -> CompletionRequest {
    let mut system = String::from(CLARIFIER_SYSTEM);
    system.push_str("\n\nProject: ");
    system.push_str(&session.project_name);
    system.push_str("\nDescription: ");
    system.push_str(&session.description);
    if !session.gathered.is_empty() {
        system.push_str("\nGathered so far: ");
        system.push_str(
            &serde_json::to_string(&session.gathered.categories).unwrap_or_default(),
        );
    }

    let recent = history.len().saturating_sub(HISTORY_WINDOW);
    let messages = history[recent..]
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|m| ChatMessage {
            role: match m.role {
                MessageRole::Assistant => swarm_adapters::ChatRole::Assistant,
                _ => swarm_adapters::ChatRole::User,
            },
            content: m.content.clone(),
        })
        .collect();

    CompletionRequest {
        system,
        messages,
        max_tokens: 2048,
        model: model.to_string(),
    }
}

/// Parse the clarifier's reply.
///
/// Returns `None` when the text is not a structured reply; the caller then
/// records a parse-error event and uses the raw text as the message.
#[must_use]
pub fn parse_reply(text: &str) -> Option<ClarifierReply> {
    let stripped = strip_code_fences(text);
    serde_json::from_str(stripped).ok()
}

/// Strip a single surrounding markdown code fence, if present.
#[must_use]
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an optional language tag on the fence line.
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .strip_suffix("```")
        .map_or(trimmed, str::trim)
}
