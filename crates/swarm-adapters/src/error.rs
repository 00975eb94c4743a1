//! Adapter error types.
//!
//! Adapters translate their native failures into this enum at the boundary;
//! callers branch only on the taxonomy class.

use swarm_core::{Classified, FaultClass};
use thiserror::Error;

/// A result type using `AdapterError`.
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors surfaced by external interface adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The upstream rate-limited the call.
    #[error("upstream rate limited")]
    RateLimited,

    /// The prompt exceeded the model's context window.
    #[error("context too long for model")]
    ContextTooLong,

    /// The upstream is unreachable or returned a server error.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The call exceeded its deadline.
    #[error("upstream call timed out")]
    Timeout,

    /// The upstream deterministically rejected the request.
    #[error("upstream rejected request (status {status}): {detail}")]
    Rejected {
        /// HTTP status or equivalent code.
        status: u16,
        /// Short reason.
        detail: String,
    },

    /// The upstream response could not be parsed.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl Classified for AdapterError {
    fn class(&self) -> FaultClass {
        match self {
            Self::RateLimited | Self::Unavailable(_) => FaultClass::Transient,
            Self::Timeout => FaultClass::Timeout,
            Self::ContextTooLong | Self::Rejected { .. } | Self::Malformed(_) => FaultClass::Fatal,
        }
    }
}

impl AdapterError {
    /// Map an HTTP status into the taxonomy, with `detail` kept for the log.
    #[must_use]
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Unavailable(detail),
            _ => Self::Rejected { status, detail },
        }
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}
