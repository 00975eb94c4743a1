//! Session lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!   input ──► clarifying ──► ready_for_docs ──► reviewing ──► approved
//!                 │ ▲                             │ ▲            │
//!                 └─┘ (turns)                     └─┘ (revise)   ▼
//!                                                            building
//!                                                             │    │
//!                                                             ▼    ▼
//!                                                      completed  failed
//!
//!   any non-terminal ──► cancelled
//! ```

use swarm_core::SessionId;
use swarm_store::SessionState;

use crate::error::{HitlError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `HitlError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    session_id: &SessionId,
    from: SessionState,
    to: SessionState,
) -> Result<SessionState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(HitlError::InvalidState {
            session_id: *session_id,
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
///
/// `clarifying` and `reviewing` self-loop: clarification turns and spec
/// revisions stay in place.
#[must_use]
pub const fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::{
        Approved, Building, Cancelled, Clarifying, Completed, Failed, Input, ReadyForDocs,
        Reviewing,
    };

    matches!(
        (from, to),
        (Input, Clarifying)
            | (Clarifying, Clarifying | ReadyForDocs)
            | (ReadyForDocs, Reviewing)
            | (Reviewing, Reviewing | Approved)
            | (Approved, Building)
            | (Building, Completed | Failed)
            | (
                Input | Clarifying | ReadyForDocs | Reviewing | Approved | Building,
                Cancelled
            )
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: SessionState) -> Vec<SessionState> {
    use SessionState::{
        Approved, Building, Cancelled, Clarifying, Completed, Failed, Input, ReadyForDocs,
        Reviewing,
    };

    match state {
        Input => vec![Clarifying, Cancelled],
        Clarifying => vec![Clarifying, ReadyForDocs, Cancelled],
        ReadyForDocs => vec![Reviewing, Cancelled],
        Reviewing => vec![Reviewing, Approved, Cancelled],
        Approved => vec![Building, Cancelled],
        Building => vec![Completed, Failed, Cancelled],
        Completed | Failed | Cancelled => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path() {
        use SessionState::*;

        assert!(is_valid_transition(Input, Clarifying));
        assert!(is_valid_transition(Clarifying, Clarifying));
        assert!(is_valid_transition(Clarifying, ReadyForDocs));
        assert!(is_valid_transition(ReadyForDocs, Reviewing));
        assert!(is_valid_transition(Reviewing, Reviewing));
        assert!(is_valid_transition(Reviewing, Approved));
        assert!(is_valid_transition(Approved, Building));
        assert!(is_valid_transition(Building, Completed));
        assert!(is_valid_transition(Building, Failed));
    }

    #[test]
    fn invalid_shortcuts() {
        use SessionState::*;

        // No skipping straight to the build.
        assert!(!is_valid_transition(Input, Building));
        assert!(!is_valid_transition(Clarifying, Approved));
        // No going backwards.
        assert!(!is_valid_transition(Reviewing, Clarifying));
        assert!(!is_valid_transition(Building, Approved));
        // Terminal states stay terminal.
        assert!(!is_valid_transition(Completed, Building));
        assert!(!is_valid_transition(Cancelled, Input));
        assert!(!is_valid_transition(Failed, Cancelled));
    }

    #[test]
    fn cancel_from_non_terminal() {
        use SessionState::*;

        for from in [Input, Clarifying, ReadyForDocs, Reviewing, Approved, Building] {
            assert!(is_valid_transition(from, Cancelled));
        }
    }

    #[test]
    fn validate_transition_err() {
        let session_id = SessionId::generate();
        let result = validate_transition(&session_id, SessionState::Input, SessionState::Building);
        match result {
            Err(HitlError::InvalidState { from, to, .. }) => {
                assert_eq!(from, SessionState::Input);
                assert_eq!(to, SessionState::Building);
            }
            _ => panic!("expected InvalidState error"),
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(valid_transitions_from(SessionState::Completed).is_empty());
        assert!(valid_transitions_from(SessionState::Failed).is_empty());
        assert!(valid_transitions_from(SessionState::Cancelled).is_empty());
    }
}
