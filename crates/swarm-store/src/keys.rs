//! Key encoding utilities for `RocksDB`.
//!
//! All composite keys are designed for prefix scans, and the state-index key
//! additionally encodes the claim ordering: priority (sign-flipped to sort
//! ascending as unsigned bytes), then creation time, then id.

use chrono::{DateTime, Utc};
use swarm_core::{SessionId, TenantId, TicketId};

/// Encode a ticket key (just the ticket ID bytes).
#[must_use]
pub fn ticket_key(ticket_id: &TicketId) -> Vec<u8> {
    ticket_id.as_bytes().to_vec()
}

/// Encode a state-index key:
/// `state || tenant_id || priority || created_at_millis || ticket_id`.
#[must_use]
pub fn state_index_key(
    state: u8,
    tenant_id: &TenantId,
    priority: i32,
    created_at: DateTime<Utc>,
    ticket_id: &TicketId,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 16 + 4 + 8 + 16);
    key.push(state);
    key.extend_from_slice(tenant_id.as_bytes());
    key.extend_from_slice(&order_preserving_priority(priority).to_be_bytes());
    key.extend_from_slice(&timestamp_millis(created_at).to_be_bytes());
    key.extend_from_slice(ticket_id.as_bytes());
    key
}

/// Prefix for scanning all tickets in one state across tenants.
#[must_use]
pub fn state_prefix(state: u8) -> Vec<u8> {
    vec![state]
}

/// Prefix for scanning all tickets in one state for one tenant.
#[must_use]
pub fn state_tenant_prefix(state: u8, tenant_id: &TenantId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(state);
    key.extend_from_slice(tenant_id.as_bytes());
    key
}

/// Extract the ticket ID from a state-index key (the trailing 16 bytes).
#[must_use]
pub fn ticket_id_from_index_key(key: &[u8]) -> TicketId {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&key[key.len() - 16..]);
    TicketId::from_uuid(uuid::Uuid::from_bytes(bytes))
}

/// Encode a session-ticket index key: `session_id || ticket_id`.
#[must_use]
pub fn session_ticket_key(session_id: &SessionId, ticket_id: &TicketId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(session_id.as_bytes());
    key.extend_from_slice(ticket_id.as_bytes());
    key
}

/// Encode a reverse dependency edge key: `dependency || dependent`.
#[must_use]
pub fn dep_edge_key(dependency: &TicketId, dependent: &TicketId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(dependency.as_bytes());
    key.extend_from_slice(dependent.as_bytes());
    key
}

/// Encode a session key (just the session ID bytes).
#[must_use]
pub fn session_key(session_id: &SessionId) -> Vec<u8> {
    session_id.as_bytes().to_vec()
}

/// Encode a tenant-session index key: `tenant_id || session_id`.
#[must_use]
pub fn tenant_session_key(tenant_id: &TenantId, session_id: &SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(tenant_id.as_bytes());
    key.extend_from_slice(session_id.as_bytes());
    key
}

/// Generic 16-byte id prefix (session, ticket, tenant scans).
#[must_use]
pub fn id_prefix(id: &impl AsRef<[u8]>) -> Vec<u8> {
    id.as_ref().to_vec()
}

/// Encode a timeline key: `scope_id || created_nanos || record_id`.
///
/// Used for messages, events, and approvals, whose key order is their write
/// order within a scope.
#[must_use]
pub fn timeline_key(scope: &impl AsRef<[u8]>, created_at: DateTime<Utc>, record_id: &uuid::Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + 8 + 16);
    key.extend_from_slice(scope.as_ref());
    key.extend_from_slice(&timestamp_nanos(created_at).to_be_bytes());
    key.extend_from_slice(record_id.as_bytes());
    key
}

/// Map an `i32` priority onto `u32` preserving order under byte-wise
/// comparison.
#[must_use]
pub fn order_preserving_priority(priority: i32) -> u32 {
    (priority as u32) ^ (1 << 31)
}

fn timestamp_millis(ts: DateTime<Utc>) -> u64 {
    u64::try_from(ts.timestamp_millis()).unwrap_or(0)
}

fn timestamp_nanos(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}
