//! Error types for the dispatch layer.

use swarm_adapters::AdapterError;
use swarm_core::{Classified, FaultClass, TicketId};
use swarm_store::{StoreError, TicketState};
use thiserror::Error;

/// A result type using `DispatchError`.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors that can occur in dispatcher, lease, and verification paths.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The referenced ticket was not found.
    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    /// The caller is not the current lease holder.
    #[error("agent {caller} does not hold the lease on ticket {ticket_id}")]
    NotLeaseHolder {
        /// The ticket in question.
        ticket_id: TicketId,
        /// The caller that attempted the operation.
        caller: String,
    },

    /// The ticket is not in a state where the operation applies.
    #[error("ticket {ticket_id} is {state:?}, which does not allow this operation")]
    WrongState {
        /// The ticket in question.
        ticket_id: TicketId,
        /// Its current state.
        state: TicketState,
    },

    /// Adapter failure.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

impl Classified for DispatchError {
    fn class(&self) -> FaultClass {
        match self {
            Self::TicketNotFound(_) => FaultClass::NotFound,
            Self::NotLeaseHolder { .. } => FaultClass::Conflict,
            Self::WrongState { .. } => FaultClass::InvalidState,
            Self::Adapter(err) => err.class(),
            Self::Store(err) => err.class(),
        }
    }
}
