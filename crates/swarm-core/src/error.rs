//! The shared fault taxonomy.
//!
//! Every error surfaced by a Swarm component maps onto exactly one
//! `FaultClass`. Adapters translate their native failures into this
//! taxonomy at the boundary; the dispatcher and HITL layers branch on the
//! class, never on adapter-specific detail.

use serde::{Deserialize, Serialize};

/// Classification of a failure, driving retry and surfacing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// A precondition for a state transition was not met. Surfaced to the
    /// caller, never retried.
    InvalidState,

    /// A referenced entity does not exist.
    NotFound,

    /// An optimistic state check lost a race. Pollers re-poll; interactive
    /// callers see a conflict.
    Conflict,

    /// Infrastructure failure in an adapter. Retried with backoff inside a
    /// budget; on exhaustion it becomes a failed attempt, not a failed
    /// ticket.
    Transient,

    /// Deterministic failure (malformed spec, schema violation). Fails the
    /// ticket immediately.
    Fatal,

    /// Lease expiry or an external-call deadline.
    Timeout,

    /// Security, auth, or tenant boundary breach. Rejected and audited.
    PolicyViolation,
}

impl FaultClass {
    /// Whether a failure of this class may be resolved by retrying.
    #[must_use]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }

    /// The HTTP status code conventionally used for this class.
    #[must_use]
    pub const fn http_status_code(self) -> u16 {
        match self {
            Self::InvalidState | Self::Conflict => 409,
            Self::NotFound => 404,
            Self::Transient => 503,
            Self::Fatal => 422,
            Self::Timeout => 504,
            Self::PolicyViolation => 403,
        }
    }

    /// Short machine-readable code for API responses and audit events.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Timeout => "timeout",
            Self::PolicyViolation => "policy_violation",
        }
    }
}

impl std::fmt::Display for FaultClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A failure classified into the taxonomy, with the detail kept for the
/// event log.
pub trait Classified {
    /// The taxonomy class of this failure.
    fn class(&self) -> FaultClass;

    /// Whether the failure may be resolved by retrying.
    fn is_retriable(&self) -> bool {
        self.class().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classes() {
        assert!(FaultClass::Transient.is_retriable());
        assert!(FaultClass::Timeout.is_retriable());
        assert!(!FaultClass::Fatal.is_retriable());
        assert!(!FaultClass::InvalidState.is_retriable());
        assert!(!FaultClass::PolicyViolation.is_retriable());
    }

    #[test]
    fn status_codes() {
        assert_eq!(FaultClass::NotFound.http_status_code(), 404);
        assert_eq!(FaultClass::Conflict.http_status_code(), 409);
        assert_eq!(FaultClass::PolicyViolation.http_status_code(), 403);
        assert_eq!(FaultClass::Fatal.http_status_code(), 422);
    }

    #[test]
    fn codes_are_snake_case() {
        assert_eq!(FaultClass::InvalidState.code(), "invalid_state");
        assert_eq!(FaultClass::PolicyViolation.to_string(), "policy_violation");
    }
}
