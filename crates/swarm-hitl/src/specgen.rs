//! Spec generation and revision prompts.

use swarm_adapters::{ChatMessage, CompletionRequest};
use swarm_store::{Message, MessageRole, Session, SpecDoc};

use crate::clarify::strip_code_fences;
use crate::error::{HitlError, Result};

const SPEC_SYSTEM: &str = "\
You are a specification writer. From the gathered project context, produce \
a build specification as a single JSON object with the fields: title, \
summary, goals (string[]), features ([{name, description, acceptance: \
string[]}]), non_goals (string[]), risks (string[]), acceptance \
(string[]). Every feature needs at least one acceptance criterion. Output \
only the JSON object.";

/// Build the completion request that generates a fresh spec.
#[must_use]
pub fn build_generation_request(session: &Session, model: &str) -> CompletionRequest {
    let mut prompt = format!(
        "Project: {}\nDescription: {}\n",
        session.project_name, session.description
    );
    prompt.push_str("Gathered context: ");
    prompt.push_str(&serde_json::to_string(&session.gathered.categories).unwrap_or_default());

    CompletionRequest {
        system: SPEC_SYSTEM.to_string(),
        messages: vec![ChatMessage::user(prompt)],
        max_tokens: 4096,
        model: model.to_string(),
    }
}

/// Build the completion request that revises the current spec.
///
/// The LLM receives the current spec, the user's feedback, and the recent
/// conversation, and returns a full replacement blob.
#[must_use]
pub fn build_revision_request(
    session: &Session,
    current: &SpecDoc,
    feedback: &str,
    history: &[Message],
    model: &str,
) -> CompletionRequest {
    let mut messages = Vec::new();
    for message in history.iter().rev().take(6).rev() {
        if message.role == MessageRole::System {
            continue;
        }
        messages.push(ChatMessage {
            role: match message.role {
                MessageRole::Assistant => swarm_adapters::ChatRole::Assistant,
                _ => swarm_adapters::ChatRole::User,
            },
            content: message.content.clone(),
        });
    }

    messages.push(ChatMessage::user(format!(
        "Current spec:\n{}\n\nRevision request: {feedback}\n\nReturn the full revised spec as JSON.",
        serde_json::to_string_pretty(current).unwrap_or_default()
    )));

    CompletionRequest {
        system: SPEC_SYSTEM.to_string(),
        messages,
        max_tokens: 4096,
        model: model.to_string(),
    }
}

/// Parse an LLM reply as a spec blob.
///
/// # Errors
///
/// Returns `HitlError::SpecParse` when the reply is not a valid spec; this
/// is deterministic and not retried.
pub fn parse_spec(text: &str) -> Result<SpecDoc> {
    let stripped = strip_code_fences(text);
    let spec: SpecDoc =
        serde_json::from_str(stripped).map_err(|e| HitlError::SpecParse(e.to_string()))?;

    if spec.title.trim().is_empty() {
        return Err(HitlError::SpecParse("spec has an empty title".into()));
    }
    Ok(spec)
}
