//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary ticket records, keyed by `ticket_id`.
    pub const TICKETS: &str = "tickets";

    /// Index: tickets by state, keyed by
    /// `state || tenant_id || priority || created_at || ticket_id`.
    ///
    /// Within one `(state, tenant)` prefix, iteration order is the claim
    /// order: priority ascending, then creation time, then id.
    pub const TICKETS_BY_STATE: &str = "tickets_by_state";

    /// Index: tickets by session, keyed by `session_id || ticket_id`.
    pub const TICKETS_BY_SESSION: &str = "tickets_by_session";

    /// Index: reverse dependency edges, keyed by
    /// `dependency_ticket_id || dependent_ticket_id`. Drives cascade.
    pub const TICKET_DEPS: &str = "ticket_deps";

    /// Primary session records, keyed by `session_id`.
    pub const SESSIONS: &str = "sessions";

    /// Index: sessions by tenant, keyed by `tenant_id || session_id`.
    pub const SESSIONS_BY_TENANT: &str = "sessions_by_tenant";

    /// Message records, keyed by `session_id || created_nanos || message_id`.
    /// Value-bearing; messages are only ever read in session order.
    pub const MESSAGES: &str = "messages";

    /// Ticket-scoped event log, keyed by
    /// `ticket_id || created_nanos || event_id`. Value-bearing; key order is
    /// write order, which makes the log replayable.
    pub const EVENTS_BY_TICKET: &str = "events_by_ticket";

    /// Session-scoped event log, keyed by
    /// `session_id || created_nanos || event_id`. An event scoped to both a
    /// ticket and its session is written to both logs.
    pub const EVENTS_BY_SESSION: &str = "events_by_session";

    /// Approval records, keyed by `session_id || created_nanos || approval_id`.
    pub const APPROVALS: &str = "approvals";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::TICKETS,
        cf::TICKETS_BY_STATE,
        cf::TICKETS_BY_SESSION,
        cf::TICKET_DEPS,
        cf::SESSIONS,
        cf::SESSIONS_BY_TENANT,
        cf::MESSAGES,
        cf::EVENTS_BY_TICKET,
        cf::EVENTS_BY_SESSION,
        cf::APPROVALS,
    ]
}
