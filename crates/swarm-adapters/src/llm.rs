//! LLM adapter.
//!
//! Text-in/text-out completion with token accounting. The HTTP client
//! targets a messages-style endpoint; deterministic error codes distinguish
//! rate limiting, context overflow, and upstream unavailability.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, Result};

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    /// Human side of the conversation.
    User,
    /// Model side of the conversation.
    Assistant,
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who spoke.
    pub role: ChatRole,
    /// The turn's text.
    pub content: String,
}

impl ChatMessage {
    /// A user turn.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// An assistant turn.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// System prompt.
    pub system: String,
    /// Conversation history, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Output token cap.
    pub max_tokens: u32,
    /// Model identifier.
    pub model: String,
}

/// Token accounting reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens consumed.
    pub input_tokens: u32,
    /// Completion tokens produced.
    pub output_tokens: u32,
}

/// A completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The generated text.
    pub text: String,
    /// Token accounting.
    pub usage: TokenUsage,
}

/// Trait for LLM completion.
///
/// Implementations must be mockable; the core invokes the model only
/// through this interface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Run one completion.
    ///
    /// # Errors
    ///
    /// Returns `AdapterError::RateLimited`, `ContextTooLong`, or
    /// `Unavailable` per the upstream's deterministic error codes.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// HTTP client for a messages-style completion endpoint.
#[derive(Debug, Clone)]
pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ChatMessage],
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: TokenUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl HttpLlmClient {
    /// Create a client for the given endpoint.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed.
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// The configured base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            // Context overflow comes back as a 400 with an explicit marker.
            if status.as_u16() == 400 && detail.contains("context") {
                return Err(AdapterError::ContextTooLong);
            }
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))?;

        let text = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        tracing::debug!(
            model = %request.model,
            input_tokens = parsed.usage.input_tokens,
            output_tokens = parsed.usage.output_tokens,
            "LLM completion finished"
        );

        Ok(Completion {
            text,
            usage: parsed.usage,
        })
    }
}

/// A scripted LLM client for tests.
///
/// Replies are popped in order; requests are recorded for assertions.
#[derive(Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    /// An empty script; every call fails as unavailable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.replies.lock().push_back(Ok(text.into()));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: AdapterError) {
        self.replies.lock().push_back(Err(error));
    }

    /// Requests observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        self.requests.lock().push(request.clone());
        match self.replies.lock().pop_front() {
            Some(Ok(text)) => Ok(Completion {
                usage: TokenUsage {
                    input_tokens: 100,
                    output_tokens: u32::try_from(text.len() / 4).unwrap_or(0),
                },
                text,
            }),
            Some(Err(err)) => Err(err),
            None => Err(AdapterError::Unavailable("llm script exhausted".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CompletionRequest {
        CompletionRequest {
            system: "You are a clarifier.".into(),
            messages: vec![ChatMessage::user("Build a health endpoint")],
            max_tokens: 1024,
            model: "claude-sonnet-4-5".into(),
        }
    }

    #[tokio::test]
    async fn complete_parses_text_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{"type": "text", "text": "hello"}],
                "usage": {"input_tokens": 12, "output_tokens": 3}
            })))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "key-1");
        let completion = client.complete(&request()).await.unwrap();

        assert_eq!(completion.text, "hello");
        assert_eq!(completion.usage.input_tokens, 12);
        assert_eq!(completion.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn rate_limit_maps_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "key-1");
        let result = client.complete(&request()).await;
        assert!(matches!(result, Err(AdapterError::RateLimited)));
    }

    #[tokio::test]
    async fn context_overflow_maps_to_context_too_long() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("prompt exceeds maximum context length"),
            )
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "key-1");
        let result = client.complete(&request()).await;
        assert!(matches!(result, Err(AdapterError::ContextTooLong)));
    }

    #[tokio::test]
    async fn server_error_maps_to_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = HttpLlmClient::new(server.uri(), "key-1");
        let result = client.complete(&request()).await;
        assert!(matches!(result, Err(AdapterError::Unavailable(_))));
    }

    #[tokio::test]
    async fn scripted_client_pops_in_order() {
        let client = ScriptedLlmClient::new();
        client.push_reply("first");
        client.push_reply("second");

        assert_eq!(client.complete(&request()).await.unwrap().text, "first");
        assert_eq!(client.complete(&request()).await.unwrap().text, "second");
        assert!(client.complete(&request()).await.is_err());
        assert_eq!(client.requests().len(), 3);
    }
}
