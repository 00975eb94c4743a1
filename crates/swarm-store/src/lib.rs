//! `RocksDB` persistence layer for the Swarm execution core.
//!
//! The store exclusively owns every persisted row: tickets, sessions,
//! messages, events, and approvals. All other components hold ids and go
//! through the [`Store`] trait.
//!
//! # Architecture
//!
//! Values are CBOR-encoded into column families, with composite-key index
//! families supporting the hot-path scans (ready candidates, stale leases,
//! cascade edges). Claims, lease extensions, and conditional updates all
//! serialize through a single write lock, which is what makes
//! [`Store::claim_next_ready`] atomic with respect to itself and to
//! `expected_state` updates: two contenders can never observe the same
//! ready ticket.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{
    AcceptanceCriterion, Actor, Approval, ApprovalKind, AssigneeKind, ClaimRequest,
    CriterionStatus, Event, GatheredContext, Lease, Message, MessageRole, Session, SessionState,
    SourceType, SpecDoc, SpecFeature, Ticket, TicketKind, TicketPatch, TicketState,
    VerificationStatus,
};

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use swarm_core::{SessionId, TenantId, TicketId};

/// The storage trait defining all database operations the core consumes.
///
/// Implementations must guarantee that `claim_next_ready`, `extend_lease`,
/// and `update_ticket` are serializable with respect to each other.
pub trait Store: Send + Sync {
    // =========================================================================
    // Ticket Operations
    // =========================================================================

    /// Insert a new ticket and its index entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_ticket(&self, ticket: &Ticket) -> Result<()>;

    /// Get a ticket by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_ticket(&self, ticket_id: &TicketId) -> Result<Option<Ticket>>;

    /// Apply a conditional partial update and return the new row.
    ///
    /// When `expected_state` is given and does not match the current state,
    /// fails with [`StoreError::StateMismatch`] and changes nothing. A state
    /// change in the patch is validated against the transition table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the ticket doesn't exist,
    /// `StoreError::StateMismatch` on a lost optimistic check, or
    /// `StoreError::IllegalTransition` for an invalid state change.
    fn update_ticket(
        &self,
        ticket_id: &TicketId,
        patch: TicketPatch,
        expected_state: Option<TicketState>,
    ) -> Result<Ticket>;

    /// Atomically claim the next ready ticket.
    ///
    /// Selects one `ready` ticket whose dependencies are all completed and
    /// whose backoff deadline has elapsed, preferring the highest priority
    /// tier and FIFO within a tier, then moves it to `claimed` with the
    /// assignee, VM binding, lease expiry, and heartbeat set. Concurrent
    /// callers never receive the same ticket. Returns `None` when no
    /// eligible work exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn claim_next_ready(&self, request: &ClaimRequest) -> Result<Option<Ticket>>;

    /// Refresh the heartbeat and extend the lease on an in-flight ticket.
    ///
    /// Idempotent within a heartbeat interval. Returns the new lease expiry.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the ticket doesn't exist,
    /// `StoreError::StateMismatch` if it is not in flight, or
    /// `StoreError::LeaseHolderMismatch` if the caller does not hold the
    /// lease.
    fn extend_lease(
        &self,
        ticket_id: &TicketId,
        assignee: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>>;

    /// Read-only view of claimable tickets, in claim order, used by the
    /// dispatcher to size VM spawning.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_ready_candidates(&self, limit: usize) -> Result<Vec<Ticket>>;

    /// Tickets in `claimed` or `in_progress` whose last heartbeat is older
    /// than `deadline`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_stale(&self, deadline: DateTime<Utc>) -> Result<Vec<Ticket>>;

    /// Tickets currently `blocked` that depend on the given ticket.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn descendants_blocked_on(&self, ticket_id: &TicketId) -> Result<Vec<Ticket>>;

    /// All tickets belonging to a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_tickets_by_session(&self, session_id: &SessionId) -> Result<Vec<Ticket>>;

    /// Per-state ticket counts for a session, used by the completion check.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn session_state_counts(&self, session_id: &SessionId) -> Result<BTreeMap<TicketState, u32>>;

    /// Number of in-flight (claimed or in-progress) tickets.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn count_in_flight(&self) -> Result<u32>;

    /// Number of in-flight tickets for one tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn count_in_flight_by_tenant(&self, tenant_id: &TenantId) -> Result<u32>;

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Insert a new session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_session(&self, session: &Session) -> Result<()>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// Overwrite a session record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_session(&self, session: &Session) -> Result<()>;

    /// All sessions belonging to a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_sessions_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Session>>;

    // =========================================================================
    // Messages, events, approvals
    // =========================================================================

    /// Append a chat message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_message(&self, message: &Message) -> Result<()>;

    /// All messages for a session, in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>>;

    /// Append an audit event to the ticket and/or session log.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_event(&self, event: &Event) -> Result<()>;

    /// The ticket-scoped event log, in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_events_by_ticket(&self, ticket_id: &TicketId) -> Result<Vec<Event>>;

    /// The session-scoped event log, in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_events_by_session(&self, session_id: &SessionId) -> Result<Vec<Event>>;

    /// Record a human decision.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn insert_approval(&self, approval: &Approval) -> Result<()>;

    /// All approvals for a session, in write order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_approvals(&self, session_id: &SessionId) -> Result<Vec<Approval>>;
}
