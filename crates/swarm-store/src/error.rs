//! Error types for the storage layer.

use swarm_core::{Classified, FaultClass};
use thiserror::Error;

use crate::types::TicketState;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("record not found")]
    NotFound,

    /// An optimistic `expected_state` check lost a race.
    #[error("state mismatch: expected {expected:?}, found {actual:?}")]
    StateMismatch {
        /// The state the caller expected.
        expected: TicketState,
        /// The state actually found.
        actual: TicketState,
    },

    /// The requested ticket state transition is not legal.
    #[error("illegal ticket transition from {from:?} to {to:?}")]
    IllegalTransition {
        /// The current state.
        from: TicketState,
        /// The requested target state.
        to: TicketState,
    },

    /// A lease operation was attempted by someone other than the holder.
    #[error("lease on ticket is held by {holder}, not {caller}")]
    LeaseHolderMismatch {
        /// The current lease holder.
        holder: String,
        /// The caller that attempted the operation.
        caller: String,
    },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Classified for StoreError {
    fn class(&self) -> FaultClass {
        match self {
            Self::NotFound => FaultClass::NotFound,
            Self::StateMismatch { .. } | Self::LeaseHolderMismatch { .. } => FaultClass::Conflict,
            Self::IllegalTransition { .. } => FaultClass::InvalidState,
            Self::Database(_) => FaultClass::Transient,
            Self::Serialization(_) => FaultClass::Fatal,
        }
    }
}
