//! Shared ticket transition helpers.
//!
//! Every state change appends an event and publishes on the bus; the
//! requeue-or-fail path is the single place the attempt budget is spent.

use chrono::Utc;
use swarm_adapters::requeue_backoff;
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::{CoreConfig, Json};
use swarm_store::{Actor, Event, Store, Ticket, TicketPatch, TicketState};

use crate::error::Result;

/// Rooms a ticket event fans out to.
#[must_use]
pub fn ticket_rooms(ticket: &Ticket) -> [Room; 4] {
    [
        Room::Ticket(ticket.ticket_id),
        Room::Session(ticket.session_id),
        Room::Project(ticket.project_id),
        Room::Tenant(ticket.tenant_id),
    ]
}

/// Render a state for the event log, in the wire vocabulary
/// (`in_progress`, not `InProgress`).
#[must_use]
pub fn state_name(state: TicketState) -> String {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_else(|| format!("{state:?}"))
}

/// Append a ticket event to the audit log.
pub fn record_ticket_event<S: Store + ?Sized>(
    store: &S,
    ticket: &Ticket,
    from: Option<TicketState>,
    to: Option<TicketState>,
    action: &str,
    actor: Actor,
    metadata: Json,
) -> Result<()> {
    store.insert_event(&Event {
        event_id: uuid::Uuid::new_v4(),
        ticket_id: Some(ticket.ticket_id),
        session_id: Some(ticket.session_id),
        from_state: from.map(state_name),
        to_state: to.map(state_name),
        action: action.to_string(),
        actor,
        actor_id: ticket.assignee.clone(),
        metadata,
        created_at: Utc::now(),
    })?;
    Ok(())
}

/// Publish a ticket update (or completion) on the bus.
pub fn publish_ticket_update(bus: &EventBus, ticket: &Ticket) {
    let kind = if ticket.state == TicketState::Completed {
        EventKind::TicketCompleted
    } else {
        EventKind::TicketUpdate
    };
    bus.publish(
        &ticket_rooms(ticket),
        &BusEvent::new(
            kind,
            serde_json::json!({
                "ticket_id": ticket.ticket_id,
                "state": ticket.state,
                "attempt": ticket.attempt,
                "pr_url": ticket.pr_url,
            }),
        ),
    );
}

/// Handle a failed attempt: requeue with backoff while the budget lasts,
/// otherwise fail the ticket out.
///
/// The requeue clears the assignee, VM binding, and lease, bumps the
/// attempt counter, and sets the backoff deadline. Failing out records the
/// human-readable reason.
pub fn requeue_or_fail<S: Store + ?Sized>(
    store: &S,
    bus: &EventBus,
    config: &CoreConfig,
    ticket: &Ticket,
    reason: &str,
    actor: Actor,
) -> Result<Ticket> {
    let from = ticket.state;

    let updated = if ticket.attempt < config.max_attempts {
        let next_attempt = ticket.attempt + 1;
        let updated = store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Ready),
                assignee: Some(None),
                vm_id: Some(None),
                lease_expires_at: Some(None),
                last_heartbeat_at: Some(None),
                attempt: Some(next_attempt),
                retry_after: Some(Some(
                    Utc::now()
                        + chrono::Duration::from_std(requeue_backoff(next_attempt))
                            .unwrap_or_else(|_| chrono::Duration::seconds(30)),
                )),
                error_message: Some(Some(reason.to_string())),
                ..TicketPatch::default()
            },
            Some(from),
        )?;
        record_ticket_event(
            store,
            &updated,
            Some(from),
            Some(TicketState::Ready),
            "requeue_attempt",
            actor,
            serde_json::json!({ "reason": reason, "attempt": next_attempt }),
        )?;
        tracing::warn!(
            ticket_id = %updated.ticket_id,
            attempt = next_attempt,
            reason,
            "Requeued failed attempt"
        );
        updated
    } else {
        let updated = store.update_ticket(
            &ticket.ticket_id,
            TicketPatch {
                state: Some(TicketState::Failed),
                error_message: Some(Some(reason.to_string())),
                ..TicketPatch::default()
            },
            Some(from),
        )?;
        record_ticket_event(
            store,
            &updated,
            Some(from),
            Some(TicketState::Failed),
            "attempts_exhausted",
            actor,
            serde_json::json!({ "reason": reason, "attempt": ticket.attempt }),
        )?;
        tracing::error!(
            ticket_id = %updated.ticket_id,
            attempt = ticket.attempt,
            reason,
            "Ticket failed out"
        );
        updated
    };

    publish_ticket_update(bus, &updated);
    Ok(updated)
}
