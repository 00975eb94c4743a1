//! `RocksDB` storage implementation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction, IteratorMode, Options,
    WriteBatch,
};
use swarm_core::{SessionId, TenantId, TicketId, VmId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{
    Approval, ClaimRequest, Event, Message, Session, Ticket, TicketPatch, TicketState,
};
use crate::Store;

/// RocksDB-backed storage implementation.
///
/// A single `claim_lock` serializes every ticket mutation. This is the
/// single-coordinator analog of row-level locking with skip-locked claims:
/// a claim scans the ready index, re-verifies dependency completion, and
/// commits the winner while holders of the lock are excluded, so a raced
/// claim observes the ticket already gone.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<rocksdb::MultiThreaded>>,
    claim_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            claim_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Collect all `(key, value)` pairs under a prefix.
    fn prefix_entries(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let cf = self.cf(cf_name)?;
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value));
        }

        Ok(entries)
    }

    /// Write a ticket row and maintain its index entries.
    ///
    /// `old` carries the previous row for state-index moves; `None` means
    /// this is an insert, which also writes the session index and the
    /// reverse dependency edges.
    fn write_ticket(&self, old: Option<&Ticket>, ticket: &Ticket) -> Result<()> {
        let cf_tickets = self.cf(cf::TICKETS)?;
        let cf_by_state = self.cf(cf::TICKETS_BY_STATE)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_tickets,
            keys::ticket_key(&ticket.ticket_id),
            Self::serialize(ticket)?,
        );

        if let Some(old) = old {
            if old.state != ticket.state {
                batch.delete_cf(
                    &cf_by_state,
                    keys::state_index_key(
                        old.state.as_u8(),
                        &old.tenant_id,
                        old.priority,
                        old.created_at,
                        &old.ticket_id,
                    ),
                );
            }
        }
        batch.put_cf(
            &cf_by_state,
            keys::state_index_key(
                ticket.state.as_u8(),
                &ticket.tenant_id,
                ticket.priority,
                ticket.created_at,
                &ticket.ticket_id,
            ),
            [],
        );

        if old.is_none() {
            let cf_by_session = self.cf(cf::TICKETS_BY_SESSION)?;
            batch.put_cf(
                &cf_by_session,
                keys::session_ticket_key(&ticket.session_id, &ticket.ticket_id),
                [],
            );

            let cf_deps = self.cf(cf::TICKET_DEPS)?;
            for dependency in &ticket.depends_on {
                batch.put_cf(
                    &cf_deps,
                    keys::dep_edge_key(dependency, &ticket.ticket_id),
                    [],
                );
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_ticket_required(&self, ticket_id: &TicketId) -> Result<Ticket> {
        self.get_ticket(ticket_id)?.ok_or(StoreError::NotFound)
    }

    /// Tickets in one state, decoded from the state index.
    fn list_by_state(&self, state: TicketState) -> Result<Vec<Ticket>> {
        let entries = self.prefix_entries(cf::TICKETS_BY_STATE, &keys::state_prefix(state.as_u8()))?;
        let mut tickets = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let ticket_id = keys::ticket_id_from_index_key(&key);
            if let Some(ticket) = self.get_ticket(&ticket_id)? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    /// Whether every dependency of the ticket has completed.
    fn dependencies_satisfied(&self, ticket: &Ticket) -> Result<bool> {
        for dependency in &ticket.depends_on {
            match self.get_ticket(dependency)? {
                Some(dep) if dep.state == TicketState::Completed => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Eligible ready tickets in claim order: backoff elapsed, dependencies
    /// completed, priority ascending then FIFO then id. Epics are excluded;
    /// they roll up through cascade instead of executing.
    fn eligible_ready(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let mut candidates: Vec<Ticket> = self
            .list_by_state(TicketState::Ready)?
            .into_iter()
            .filter(|t| t.kind != crate::types::TicketKind::Epic)
            .filter(|t| t.retry_after.is_none_or(|deadline| deadline <= now))
            .collect();

        candidates.sort_by(|a, b| {
            (a.priority, a.created_at, a.ticket_id).cmp(&(b.priority, b.created_at, b.ticket_id))
        });

        let mut eligible = Vec::with_capacity(candidates.len());
        for ticket in candidates {
            if self.dependencies_satisfied(&ticket)? {
                eligible.push(ticket);
            }
        }
        Ok(eligible)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Ticket Operations
    // =========================================================================

    fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let _guard = self.claim_lock.lock();
        self.write_ticket(None, ticket)
    }

    fn get_ticket(&self, ticket_id: &TicketId) -> Result<Option<Ticket>> {
        let cf = self.cf(cf::TICKETS)?;
        self.db
            .get_cf(&cf, keys::ticket_key(ticket_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn update_ticket(
        &self,
        ticket_id: &TicketId,
        patch: TicketPatch,
        expected_state: Option<TicketState>,
    ) -> Result<Ticket> {
        let _guard = self.claim_lock.lock();

        let old = self.get_ticket_required(ticket_id)?;

        if let Some(expected) = expected_state {
            if old.state != expected {
                return Err(StoreError::StateMismatch {
                    expected,
                    actual: old.state,
                });
            }
        }

        if let Some(to) = patch.state {
            if to != old.state && !TicketState::can_transition(old.state, to) {
                return Err(StoreError::IllegalTransition {
                    from: old.state,
                    to,
                });
            }
        }

        let mut ticket = old.clone();
        patch.apply(&mut ticket, Utc::now());
        self.write_ticket(Some(&old), &ticket)?;

        Ok(ticket)
    }

    fn claim_next_ready(&self, request: &ClaimRequest) -> Result<Option<Ticket>> {
        let _guard = self.claim_lock.lock();

        let now = Utc::now();
        let eligible = self.eligible_ready(now)?;
        let mut in_flight_cache: HashMap<TenantId, u32> = HashMap::new();

        for old in eligible {
            if let Some(tenant) = request.tenant {
                if old.tenant_id != tenant {
                    continue;
                }
            }
            if let Some(project) = request.project {
                if old.project_id != project {
                    continue;
                }
            }
            if let Some(cap) = request.tenant_cap {
                let in_flight = match in_flight_cache.get(&old.tenant_id) {
                    Some(count) => *count,
                    None => {
                        let count = self.count_in_flight_by_tenant(&old.tenant_id)?;
                        in_flight_cache.insert(old.tenant_id, count);
                        count
                    }
                };
                if in_flight >= cap {
                    continue;
                }
            }

            let mut ticket = old.clone();
            ticket.state = TicketState::Claimed;
            ticket.assignee = Some(request.assignee.clone());
            ticket.assignee_kind = request.assignee_kind;
            ticket.vm_id = Some(
                request
                    .vm_id
                    .unwrap_or_else(|| VmId::allocate(&ticket.ticket_id, ticket.attempt)),
            );
            ticket.lease_expires_at = Some(
                now + chrono::Duration::from_std(request.lease)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            );
            ticket.last_heartbeat_at = Some(now);
            ticket.retry_after = None;
            ticket.updated_at = now;

            self.write_ticket(Some(&old), &ticket)?;

            tracing::debug!(
                ticket_id = %ticket.ticket_id,
                assignee = %request.assignee,
                attempt = ticket.attempt,
                "Claimed ticket"
            );
            return Ok(Some(ticket));
        }

        Ok(None)
    }

    fn extend_lease(
        &self,
        ticket_id: &TicketId,
        assignee: &str,
        lease: Duration,
    ) -> Result<DateTime<Utc>> {
        let _guard = self.claim_lock.lock();

        let old = self.get_ticket_required(ticket_id)?;
        if !old.state.is_in_flight() {
            return Err(StoreError::StateMismatch {
                expected: TicketState::InProgress,
                actual: old.state,
            });
        }
        let holder = old.assignee.clone().unwrap_or_default();
        if holder != assignee {
            return Err(StoreError::LeaseHolderMismatch {
                holder,
                caller: assignee.to_string(),
            });
        }

        let now = Utc::now();
        let expires = now
            + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::minutes(30));

        let mut ticket = old.clone();
        ticket.last_heartbeat_at = Some(now);
        ticket.lease_expires_at = Some(expires);
        ticket.updated_at = now;
        self.write_ticket(Some(&old), &ticket)?;

        Ok(expires)
    }

    fn list_ready_candidates(&self, limit: usize) -> Result<Vec<Ticket>> {
        let mut eligible = self.eligible_ready(Utc::now())?;
        eligible.truncate(limit);
        Ok(eligible)
    }

    fn list_stale(&self, deadline: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let mut stale = Vec::new();
        for state in [TicketState::Claimed, TicketState::InProgress] {
            for ticket in self.list_by_state(state)? {
                if ticket
                    .last_heartbeat_at
                    .is_none_or(|heartbeat| heartbeat < deadline)
                {
                    stale.push(ticket);
                }
            }
        }
        Ok(stale)
    }

    fn descendants_blocked_on(&self, ticket_id: &TicketId) -> Result<Vec<Ticket>> {
        let entries = self.prefix_entries(cf::TICKET_DEPS, &keys::id_prefix(ticket_id))?;
        let mut descendants = Vec::new();
        for (key, _) in entries {
            let dependent = keys::ticket_id_from_index_key(&key);
            if let Some(ticket) = self.get_ticket(&dependent)? {
                if ticket.state == TicketState::Blocked {
                    descendants.push(ticket);
                }
            }
        }
        Ok(descendants)
    }

    fn list_tickets_by_session(&self, session_id: &SessionId) -> Result<Vec<Ticket>> {
        let entries = self.prefix_entries(cf::TICKETS_BY_SESSION, &keys::id_prefix(session_id))?;
        let mut tickets = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let ticket_id = keys::ticket_id_from_index_key(&key);
            if let Some(ticket) = self.get_ticket(&ticket_id)? {
                tickets.push(ticket);
            }
        }
        Ok(tickets)
    }

    fn session_state_counts(&self, session_id: &SessionId) -> Result<BTreeMap<TicketState, u32>> {
        let mut counts = BTreeMap::new();
        for ticket in self.list_tickets_by_session(session_id)? {
            *counts.entry(ticket.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn count_in_flight(&self) -> Result<u32> {
        let mut count = 0u32;
        for state in [TicketState::Claimed, TicketState::InProgress] {
            let entries = self.prefix_entries(cf::TICKETS_BY_STATE, &keys::state_prefix(state.as_u8()))?;
            count += u32::try_from(entries.len()).unwrap_or(u32::MAX);
        }
        Ok(count)
    }

    fn count_in_flight_by_tenant(&self, tenant_id: &TenantId) -> Result<u32> {
        let mut count = 0u32;
        for state in [TicketState::Claimed, TicketState::InProgress] {
            let prefix = keys::state_tenant_prefix(state.as_u8(), tenant_id);
            let entries = self.prefix_entries(cf::TICKETS_BY_STATE, &prefix)?;
            count += u32::try_from(entries.len()).unwrap_or(u32::MAX);
        }
        Ok(count)
    }

    // =========================================================================
    // Session Operations
    // =========================================================================

    fn insert_session(&self, session: &Session) -> Result<()> {
        let cf_sessions = self.cf(cf::SESSIONS)?;
        let cf_by_tenant = self.cf(cf::SESSIONS_BY_TENANT)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            &cf_sessions,
            keys::session_key(&session.session_id),
            Self::serialize(session)?,
        );
        batch.put_cf(
            &cf_by_tenant,
            keys::tenant_session_key(&session.tenant_id, &session.session_id),
            [],
        );

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn get_session(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let cf = self.cf(cf::SESSIONS)?;
        self.db
            .get_cf(&cf, keys::session_key(session_id))
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn put_session(&self, session: &Session) -> Result<()> {
        let cf = self.cf(cf::SESSIONS)?;
        self.db
            .put_cf(
                &cf,
                keys::session_key(&session.session_id),
                Self::serialize(session)?,
            )
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_sessions_by_tenant(&self, tenant_id: &TenantId) -> Result<Vec<Session>> {
        let entries = self.prefix_entries(cf::SESSIONS_BY_TENANT, &keys::id_prefix(tenant_id))?;
        let mut sessions = Vec::with_capacity(entries.len());
        for (key, _) in entries {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&key[16..32]);
            let session_id = SessionId::from_uuid(uuid::Uuid::from_bytes(bytes));
            if let Some(session) = self.get_session(&session_id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    // =========================================================================
    // Messages, events, approvals
    // =========================================================================

    fn insert_message(&self, message: &Message) -> Result<()> {
        let cf = self.cf(cf::MESSAGES)?;
        let key = keys::timeline_key(&message.session_id, message.created_at, &message.message_id);
        self.db
            .put_cf(&cf, key, Self::serialize(message)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_messages(&self, session_id: &SessionId) -> Result<Vec<Message>> {
        let entries = self.prefix_entries(cf::MESSAGES, &keys::id_prefix(session_id))?;
        entries
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    fn insert_event(&self, event: &Event) -> Result<()> {
        let mut batch = WriteBatch::default();
        let value = Self::serialize(event)?;

        if let Some(ticket_id) = event.ticket_id {
            let cf = self.cf(cf::EVENTS_BY_TICKET)?;
            batch.put_cf(
                &cf,
                keys::timeline_key(&ticket_id, event.created_at, &event.event_id),
                &value,
            );
        }
        if let Some(session_id) = event.session_id {
            let cf = self.cf(cf::EVENTS_BY_SESSION)?;
            batch.put_cf(
                &cf,
                keys::timeline_key(&session_id, event.created_at, &event.event_id),
                &value,
            );
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_events_by_ticket(&self, ticket_id: &TicketId) -> Result<Vec<Event>> {
        let entries = self.prefix_entries(cf::EVENTS_BY_TICKET, &keys::id_prefix(ticket_id))?;
        entries
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    fn list_events_by_session(&self, session_id: &SessionId) -> Result<Vec<Event>> {
        let entries = self.prefix_entries(cf::EVENTS_BY_SESSION, &keys::id_prefix(session_id))?;
        entries
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }

    fn insert_approval(&self, approval: &Approval) -> Result<()> {
        let cf = self.cf(cf::APPROVALS)?;
        let key = keys::timeline_key(
            &approval.session_id,
            approval.created_at,
            &approval.approval_id,
        );
        self.db
            .put_cf(&cf, key, Self::serialize(approval)?)
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    fn list_approvals(&self, session_id: &SessionId) -> Result<Vec<Approval>> {
        let entries = self.prefix_entries(cf::APPROVALS, &keys::id_prefix(session_id))?;
        entries
            .iter()
            .map(|(_, value)| Self::deserialize(value))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Actor, ApprovalKind, AssigneeKind, MessageRole, SessionState, TicketKind,
        VerificationStatus,
    };
    use swarm_core::ProjectId;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn test_ticket(session_id: SessionId, tenant_id: TenantId, title: &str) -> Ticket {
        let now = Utc::now();
        Ticket {
            ticket_id: TicketId::generate(),
            session_id,
            project_id: ProjectId::generate(),
            tenant_id,
            title: title.to_string(),
            description: format!("{title} description"),
            parent_id: None,
            priority: 10,
            state: TicketState::Ready,
            kind: TicketKind::Feature,
            assignee_kind: AssigneeKind::Agent,
            assignee: None,
            vm_id: None,
            lease_expires_at: None,
            last_heartbeat_at: None,
            depends_on: Vec::new(),
            blocked_by: 0,
            branch_name: None,
            pr_url: None,
            acceptance_criteria: Vec::new(),
            attempt: 1,
            verification: VerificationStatus::Pending,
            rejection_count: 0,
            outputs: None,
            error_message: None,
            retry_after: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    fn claim_request(assignee: &str) -> ClaimRequest {
        ClaimRequest {
            assignee: assignee.to_string(),
            assignee_kind: AssigneeKind::Agent,
            vm_id: None,
            lease: Duration::from_secs(1800),
            tenant: None,
            project: None,
            tenant_cap: None,
        }
    }

    #[test]
    fn ticket_crud() {
        let (store, _dir) = create_test_store();
        let ticket = test_ticket(SessionId::generate(), TenantId::generate(), "crud");

        store.insert_ticket(&ticket).unwrap();
        let loaded = store.get_ticket(&ticket.ticket_id).unwrap().unwrap();
        assert_eq!(loaded.title, "crud");
        assert_eq!(loaded.state, TicketState::Ready);

        let updated = store
            .update_ticket(
                &ticket.ticket_id,
                TicketPatch {
                    state: Some(TicketState::Hold),
                    ..TicketPatch::default()
                },
                Some(TicketState::Ready),
            )
            .unwrap();
        assert_eq!(updated.state, TicketState::Hold);
    }

    #[test]
    fn update_ticket_expected_state_mismatch() {
        let (store, _dir) = create_test_store();
        let ticket = test_ticket(SessionId::generate(), TenantId::generate(), "mismatch");
        store.insert_ticket(&ticket).unwrap();

        let result = store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Claimed),
                ..TicketPatch::default()
            },
            Some(TicketState::Draft),
        );
        assert!(matches!(result, Err(StoreError::StateMismatch { .. })));
    }

    #[test]
    fn update_ticket_illegal_transition() {
        let (store, _dir) = create_test_store();
        let mut ticket = test_ticket(SessionId::generate(), TenantId::generate(), "illegal");
        ticket.state = TicketState::Draft;
        store.insert_ticket(&ticket).unwrap();

        let result = store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Claimed),
                ..TicketPatch::default()
            },
            None,
        );
        assert!(matches!(result, Err(StoreError::IllegalTransition { .. })));
    }

    #[test]
    fn claim_respects_priority_then_fifo() {
        let (store, _dir) = create_test_store();
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        let mut low = test_ticket(session, tenant, "low-priority");
        low.priority = 50;
        let mut high = test_ticket(session, tenant, "high-priority");
        high.priority = 1;
        high.created_at = low.created_at + chrono::Duration::seconds(1);

        store.insert_ticket(&low).unwrap();
        store.insert_ticket(&high).unwrap();

        let first = store.claim_next_ready(&claim_request("agent-a")).unwrap().unwrap();
        assert_eq!(first.ticket_id, high.ticket_id);
        assert_eq!(first.state, TicketState::Claimed);
        assert!(first.vm_id.is_some());
        assert!(first.lease_expires_at.unwrap() > Utc::now());

        let second = store.claim_next_ready(&claim_request("agent-b")).unwrap().unwrap();
        assert_eq!(second.ticket_id, low.ticket_id);

        assert!(store.claim_next_ready(&claim_request("agent-c")).unwrap().is_none());
    }

    #[test]
    fn claim_skips_unsatisfied_dependencies() {
        let (store, _dir) = create_test_store();
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        let mut dep = test_ticket(session, tenant, "dependency");
        dep.state = TicketState::Claimed;
        store.insert_ticket(&dep).unwrap();

        let mut dependent = test_ticket(session, tenant, "dependent");
        dependent.depends_on = vec![dep.ticket_id];
        store.insert_ticket(&dependent).unwrap();

        // Dependency not completed, so nothing is claimable.
        assert!(store.claim_next_ready(&claim_request("agent")).unwrap().is_none());
    }

    #[test]
    fn claim_skips_backoff_deadline() {
        let (store, _dir) = create_test_store();
        let mut ticket = test_ticket(SessionId::generate(), TenantId::generate(), "backoff");
        ticket.retry_after = Some(Utc::now() + chrono::Duration::minutes(5));
        store.insert_ticket(&ticket).unwrap();

        assert!(store.claim_next_ready(&claim_request("agent")).unwrap().is_none());
    }

    #[test]
    fn claim_enforces_tenant_cap() {
        let (store, _dir) = create_test_store();
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        let mut in_flight = test_ticket(session, tenant, "in-flight");
        in_flight.state = TicketState::InProgress;
        store.insert_ticket(&in_flight).unwrap();

        let ready = test_ticket(session, tenant, "ready");
        store.insert_ticket(&ready).unwrap();

        let mut request = claim_request("agent");
        request.tenant_cap = Some(1);
        assert!(store.claim_next_ready(&request).unwrap().is_none());

        request.tenant_cap = Some(2);
        assert!(store.claim_next_ready(&request).unwrap().is_some());
    }

    #[test]
    fn concurrent_claims_are_disjoint() {
        let (store, _dir) = create_test_store();
        let store = Arc::new(store);
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        for i in 0..4 {
            store
                .insert_ticket(&test_ticket(session, tenant, &format!("t{i}")))
                .unwrap();
        }

        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                store
                    .claim_next_ready(&claim_request(&format!("agent-{worker}")))
                    .unwrap()
            }));
        }

        let mut claimed: Vec<TicketId> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .map(|t| t.ticket_id)
            .collect();
        claimed.sort();
        let total = claimed.len();
        claimed.dedup();

        // 4 tickets, 8 contenders: exactly 4 claims, no duplicates.
        assert_eq!(total, 4);
        assert_eq!(claimed.len(), 4);
    }

    #[test]
    fn extend_lease_checks_holder() {
        let (store, _dir) = create_test_store();
        let ticket = test_ticket(SessionId::generate(), TenantId::generate(), "lease");
        store.insert_ticket(&ticket).unwrap();

        let claimed = store.claim_next_ready(&claim_request("agent-a")).unwrap().unwrap();

        let expires = store
            .extend_lease(&claimed.ticket_id, "agent-a", Duration::from_secs(60))
            .unwrap();
        assert!(expires > Utc::now());

        let result = store.extend_lease(&claimed.ticket_id, "agent-b", Duration::from_secs(60));
        assert!(matches!(result, Err(StoreError::LeaseHolderMismatch { .. })));
    }

    #[test]
    fn list_stale_finds_expired_heartbeats() {
        let (store, _dir) = create_test_store();
        let ticket = test_ticket(SessionId::generate(), TenantId::generate(), "stale");
        store.insert_ticket(&ticket).unwrap();
        store.claim_next_ready(&claim_request("agent")).unwrap().unwrap();

        // Heartbeat was just set, so nothing is stale against a past deadline.
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.list_stale(past).unwrap().is_empty());

        // Against a future deadline the heartbeat is older and shows up.
        let future = Utc::now() + chrono::Duration::minutes(5);
        let stale = store.list_stale(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].ticket_id, ticket.ticket_id);
    }

    #[test]
    fn descendants_blocked_on_dependency() {
        let (store, _dir) = create_test_store();
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        let dep = test_ticket(session, tenant, "dep");
        store.insert_ticket(&dep).unwrap();

        let mut blocked = test_ticket(session, tenant, "blocked");
        blocked.state = TicketState::Blocked;
        blocked.depends_on = vec![dep.ticket_id];
        blocked.blocked_by = 1;
        store.insert_ticket(&blocked).unwrap();

        let mut ready_dependent = test_ticket(session, tenant, "ready-dependent");
        ready_dependent.depends_on = vec![dep.ticket_id];
        store.insert_ticket(&ready_dependent).unwrap();

        let descendants = store.descendants_blocked_on(&dep.ticket_id).unwrap();
        assert_eq!(descendants.len(), 1);
        assert_eq!(descendants[0].ticket_id, blocked.ticket_id);
    }

    #[test]
    fn session_state_counts_groups() {
        let (store, _dir) = create_test_store();
        let session = SessionId::generate();
        let tenant = TenantId::generate();

        for state in [TicketState::Ready, TicketState::Ready, TicketState::Blocked] {
            let mut ticket = test_ticket(session, tenant, "t");
            ticket.state = state;
            store.insert_ticket(&ticket).unwrap();
        }

        let counts = store.session_state_counts(&session).unwrap();
        assert_eq!(counts.get(&TicketState::Ready), Some(&2));
        assert_eq!(counts.get(&TicketState::Blocked), Some(&1));
    }

    #[test]
    fn session_crud_and_tenant_listing() {
        let (store, _dir) = create_test_store();
        let tenant = TenantId::generate();
        let now = Utc::now();

        let session = Session {
            session_id: SessionId::generate(),
            tenant_id: tenant,
            project_id: None,
            state: SessionState::Input,
            project_name: "demo".to_string(),
            description: "Add /health endpoint returning 200".to_string(),
            gathered: crate::types::GatheredContext::default(),
            spec: None,
            progress: 0,
            source: crate::types::SourceType::Direct,
            repo_url: None,
            analysis: None,
            clarification_turns: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        store.insert_session(&session).unwrap();

        let loaded = store.get_session(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Input);

        let mut updated = loaded;
        updated.state = SessionState::Clarifying;
        store.put_session(&updated).unwrap();
        assert_eq!(
            store.get_session(&session.session_id).unwrap().unwrap().state,
            SessionState::Clarifying
        );

        let listed = store.list_sessions_by_tenant(&tenant).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn events_replay_in_write_order() {
        let (store, _dir) = create_test_store();
        let ticket_id = TicketId::generate();
        let session_id = SessionId::generate();

        for (i, action) in ["activate", "claim", "start"].iter().enumerate() {
            let event = Event {
                event_id: uuid::Uuid::new_v4(),
                ticket_id: Some(ticket_id),
                session_id: Some(session_id),
                from_state: None,
                to_state: None,
                action: (*action).to_string(),
                actor: Actor::System,
                actor_id: None,
                metadata: serde_json::json!({}),
                created_at: Utc::now() + chrono::Duration::milliseconds(i as i64),
            };
            store.insert_event(&event).unwrap();
        }

        let by_ticket = store.list_events_by_ticket(&ticket_id).unwrap();
        let actions: Vec<&str> = by_ticket.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["activate", "claim", "start"]);

        // The same events appear on the session log.
        assert_eq!(store.list_events_by_session(&session_id).unwrap().len(), 3);
    }

    #[test]
    fn messages_in_order() {
        let (store, _dir) = create_test_store();
        let session_id = SessionId::generate();

        for (i, content) in ["first", "second"].iter().enumerate() {
            store
                .insert_message(&Message {
                    message_id: uuid::Uuid::new_v4(),
                    session_id,
                    role: MessageRole::User,
                    content: (*content).to_string(),
                    message_type: "chat".to_string(),
                    metadata: serde_json::json!({}),
                    created_at: Utc::now() + chrono::Duration::milliseconds(i as i64),
                })
                .unwrap();
        }

        let messages = store.list_messages(&session_id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "first");
    }

    #[test]
    fn approvals_roundtrip() {
        let (store, _dir) = create_test_store();
        let session_id = SessionId::generate();

        store
            .insert_approval(&Approval {
                approval_id: uuid::Uuid::new_v4(),
                session_id,
                kind: ApprovalKind::SpecApproval,
                approver: "user-1".to_string(),
                ip: Some("10.0.0.1".to_string()),
                user_agent: Some("curl/8".to_string()),
                data: serde_json::json!({"note": "lgtm"}),
                created_at: Utc::now(),
            })
            .unwrap();

        let approvals = store.list_approvals(&session_id).unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].kind, ApprovalKind::SpecApproval);
    }
}
