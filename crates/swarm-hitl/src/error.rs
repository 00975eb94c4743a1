//! Error types for the HITL layer.

use swarm_adapters::AdapterError;
use swarm_core::{Classified, FaultClass, SessionId};
use swarm_store::{SessionState, StoreError};
use thiserror::Error;

/// A result type using `HitlError`.
pub type Result<T> = std::result::Result<T, HitlError>;

/// Errors that can occur in session and generator operations.
#[derive(Debug, Error)]
pub enum HitlError {
    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// The requested state transition is not valid.
    #[error(
        "invalid state transition for session {session_id}: cannot transition from {from:?} to {to:?}"
    )]
    InvalidState {
        /// The session being transitioned.
        session_id: SessionId,
        /// The current state.
        from: SessionState,
        /// The requested target state.
        to: SessionState,
    },

    /// A precondition for the operation was not met.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The LLM reply could not be parsed as a spec blob.
    #[error("spec parse failed: {0}")]
    SpecParse(String),

    /// The generated ticket DAG contains a cycle.
    #[error("dependency cycle detected in generated tickets")]
    DependencyCycle,

    /// LLM adapter failure.
    #[error("llm error: {0}")]
    Llm(#[from] AdapterError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Classified for HitlError {
    fn class(&self) -> FaultClass {
        match self {
            Self::SessionNotFound(_) => FaultClass::NotFound,
            Self::InvalidState { .. } | Self::Precondition(_) => FaultClass::InvalidState,
            Self::SpecParse(_) | Self::DependencyCycle => FaultClass::Fatal,
            Self::Llm(err) => err.class(),
            Self::Store(err) => err.class(),
        }
    }
}
