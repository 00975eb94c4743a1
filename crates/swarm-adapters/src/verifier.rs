//! Verifier adapter.
//!
//! Static and automated checks over an agent's branch. A `failed` verdict
//! is a normal result, not an error; only infrastructure problems surface
//! as `AdapterError`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use swarm_core::{Json, TicketId};

use crate::error::{AdapterError, Result};

/// A verification request for one ticket attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyRequest {
    /// The ticket under verification.
    pub ticket_id: TicketId,
    /// The branch carrying the agent's changes.
    pub branch: String,
    /// The repository, when known.
    pub repo_url: Option<String>,
    /// Attempt number.
    pub attempt: u32,
    /// Check phases to run.
    pub phases: Vec<String>,
}

/// Verdict status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    /// All checks passed.
    Passed,
    /// At least one check failed.
    Failed,
}

/// Structured verifier verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    /// Overall outcome.
    pub status: VerdictStatus,
    /// Feedback surfaced to the agent on the next attempt.
    #[serde(default)]
    pub feedback_for_agent: Option<String>,
    /// Full check detail, kept for the event log.
    #[serde(default)]
    pub details: Json,
}

impl Verdict {
    /// A passing verdict with no detail.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            status: VerdictStatus::Passed,
            feedback_for_agent: None,
            details: Json::Null,
        }
    }

    /// A failing verdict with feedback for the agent.
    #[must_use]
    pub fn failed(feedback: impl Into<String>) -> Self {
        Self {
            status: VerdictStatus::Failed,
            feedback_for_agent: Some(feedback.into()),
            details: Json::Null,
        }
    }
}

/// Trait for result verification.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Verify one attempt.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures; a negative
    /// verdict is `Ok`.
    async fn verify(&self, request: &VerifyRequest) -> Result<Verdict>;
}

/// HTTP client for a verifier service.
#[derive(Debug, Clone)]
pub struct HttpVerifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVerifier {
    /// Create a client for the given service.
    ///
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Verifier for HttpVerifier {
    async fn verify(&self, request: &VerifyRequest) -> Result<Verdict> {
        let url = format!("{}/v1/verify", self.base_url);
        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AdapterError::from_status(status.as_u16(), detail));
        }

        response
            .json()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }
}

/// A scripted verifier for tests.
///
/// Verdicts are popped in order; once the script is exhausted every attempt
/// passes.
#[derive(Default)]
pub struct StaticVerifier {
    verdicts: Mutex<VecDeque<Result<Verdict>>>,
    requests: Mutex<Vec<VerifyRequest>>,
}

impl StaticVerifier {
    /// A verifier that passes everything.
    #[must_use]
    pub fn passing() -> Self {
        Self::default()
    }

    /// Queue a verdict.
    pub fn push_verdict(&self, verdict: Verdict) {
        self.verdicts.lock().push_back(Ok(verdict));
    }

    /// Queue an infrastructure failure.
    pub fn push_error(&self, error: AdapterError) {
        self.verdicts.lock().push_back(Err(error));
    }

    /// Requests observed so far.
    #[must_use]
    pub fn requests(&self) -> Vec<VerifyRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Verifier for StaticVerifier {
    async fn verify(&self, request: &VerifyRequest) -> Result<Verdict> {
        self.requests.lock().push(request.clone());
        match self.verdicts.lock().pop_front() {
            Some(result) => result,
            None => Ok(Verdict::passed()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> VerifyRequest {
        VerifyRequest {
            ticket_id: TicketId::generate(),
            branch: "swarm/t-1".into(),
            repo_url: None,
            attempt: 1,
            phases: vec!["static".into(), "tests".into()],
        }
    }

    #[tokio::test]
    async fn verify_parses_verdict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/verify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "failed",
                "feedback_for_agent": "missing 200 case",
                "details": {"phase": "tests"}
            })))
            .mount(&server)
            .await;

        let verifier = HttpVerifier::new(server.uri());
        let verdict = verifier.verify(&request()).await.unwrap();

        assert_eq!(verdict.status, VerdictStatus::Failed);
        assert_eq!(verdict.feedback_for_agent.as_deref(), Some("missing 200 case"));
    }

    #[tokio::test]
    async fn unreachable_verifier_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/verify"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let verifier = HttpVerifier::new(server.uri());
        let result = verifier.verify(&request()).await;
        assert!(matches!(result, Err(AdapterError::Unavailable(_))));
    }

    #[tokio::test]
    async fn static_verifier_scripts_then_passes() {
        let verifier = StaticVerifier::passing();
        verifier.push_verdict(Verdict::failed("nope"));

        let first = verifier.verify(&request()).await.unwrap();
        assert_eq!(first.status, VerdictStatus::Failed);

        let second = verifier.verify(&request()).await.unwrap();
        assert_eq!(second.status, VerdictStatus::Passed);
        assert_eq!(verifier.requests().len(), 2);
    }
}
