//! Dependency cascade and session completion.
//!
//! When a ticket completes, its blocked descendants re-check their
//! dependencies and open as `ready`; epics roll up to `completed` without
//! executing. Every terminal transition triggers the session completion
//! check.

use chrono::Utc;
use swarm_bus::{BusEvent, EventBus, EventKind, Room};
use swarm_core::{SessionId, TicketId};
use swarm_store::{
    Actor, Event, Session, SessionState, Store, TicketKind, TicketPatch, TicketState,
};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::transitions::{publish_ticket_update, record_ticket_event};

/// Signal that a ticket reached a terminal state.
#[derive(Debug, Clone, Copy)]
pub struct CompletionSignal {
    /// The terminal ticket.
    pub ticket_id: TicketId,
}

fn session_state_name(state: SessionState) -> Option<String> {
    serde_json::to_value(state)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
}

/// Open blocked descendants of a completed ticket.
///
/// Idempotent: a second invocation for the same ticket finds no remaining
/// blocked descendants and changes nothing. Returns the number of tickets
/// opened (roll-ups included).
pub fn unblock_descendants<S: Store + ?Sized>(
    store: &S,
    bus: &EventBus,
    ticket_id: &TicketId,
) -> Result<u32> {
    let mut opened = 0u32;

    for descendant in store.descendants_blocked_on(ticket_id)? {
        let mut unsatisfied = 0u32;
        for dep in &descendant.depends_on {
            match store.get_ticket(dep)? {
                Some(dep_ticket) if dep_ticket.state == TicketState::Completed => {}
                _ => unsatisfied += 1,
            }
        }

        if unsatisfied > 0 {
            // Keep the derived counter honest even when still blocked.
            store.update_ticket(
                &descendant.ticket_id,
                TicketPatch {
                    blocked_by: Some(unsatisfied),
                    ..TicketPatch::default()
                },
                Some(TicketState::Blocked),
            )?;
            continue;
        }

        let opened_ticket = store.update_ticket(
            &descendant.ticket_id,
            TicketPatch {
                state: Some(TicketState::Ready),
                blocked_by: Some(0),
                ..TicketPatch::default()
            },
            Some(TicketState::Blocked),
        )?;
        record_ticket_event(
            store,
            &opened_ticket,
            Some(TicketState::Blocked),
            Some(TicketState::Ready),
            "cascade_unblock",
            Actor::System,
            serde_json::json!({ "unblocked_by": ticket_id }),
        )?;
        publish_ticket_update(bus, &opened_ticket);
        opened += 1;

        // Epics never execute; they complete as soon as their plan does.
        if opened_ticket.kind == TicketKind::Epic {
            let completed = store.update_ticket(
                &opened_ticket.ticket_id,
                TicketPatch {
                    state: Some(TicketState::Completed),
                    ..TicketPatch::default()
                },
                Some(TicketState::Ready),
            )?;
            record_ticket_event(
                store,
                &completed,
                Some(TicketState::Ready),
                Some(TicketState::Completed),
                "epic_rollup",
                Actor::System,
                serde_json::json!({}),
            )?;
            publish_ticket_update(bus, &completed);
        }
    }

    Ok(opened)
}

/// Check whether the session owning this ticket can finish.
///
/// A session in `building` completes when no ticket can make progress:
/// every ticket is terminal, or permanently blocked behind a failed or
/// cancelled dependency. The outcome is `failed` when any ticket failed or
/// is permanently stuck, `completed` when at least one ticket completed,
/// and `failed` when the build delivered nothing.
pub fn check_session_completion<S: Store + ?Sized>(
    store: &S,
    bus: &EventBus,
    session_id: &SessionId,
) -> Result<Option<SessionState>> {
    let Some(session) = store.get_session(session_id)? else {
        return Ok(None);
    };
    if session.state != SessionState::Building {
        return Ok(None);
    }

    let tickets = store.list_tickets_by_session(session_id)?;

    // A blocked ticket is permanently stuck when some dependency failed,
    // was cancelled, or is itself stuck. Propagate to a fixpoint so a
    // whole chain behind one cancelled ticket counts as stuck.
    let states: std::collections::HashMap<_, _> =
        tickets.iter().map(|t| (t.ticket_id, t.state)).collect();
    let mut stuck: std::collections::HashSet<swarm_core::TicketId> =
        std::collections::HashSet::new();
    loop {
        let mut changed = false;
        for ticket in &tickets {
            if ticket.state != TicketState::Blocked || stuck.contains(&ticket.ticket_id) {
                continue;
            }
            let dead = ticket.depends_on.iter().any(|dep| {
                stuck.contains(dep)
                    || matches!(
                        states.get(dep),
                        Some(TicketState::Failed | TicketState::Cancelled)
                    )
            });
            if dead {
                stuck.insert(ticket.ticket_id);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut any_completed = false;
    let mut any_failed = false;
    let any_stuck = !stuck.is_empty();

    for ticket in &tickets {
        match ticket.state {
            TicketState::Completed => any_completed = true,
            TicketState::Failed => any_failed = true,
            TicketState::Cancelled => {}
            TicketState::Blocked => {
                if !stuck.contains(&ticket.ticket_id) {
                    // A live dependency chain: cascade will get here.
                    return Ok(None);
                }
            }
            // Work remains.
            _ => return Ok(None),
        }
    }

    let outcome = if any_failed || any_stuck {
        SessionState::Failed
    } else if any_completed {
        SessionState::Completed
    } else {
        SessionState::Failed
    };

    let mut updated = session;
    finish_session(store, bus, &mut updated, outcome)?;
    Ok(Some(outcome))
}

fn finish_session<S: Store + ?Sized>(
    store: &S,
    bus: &EventBus,
    session: &mut Session,
    outcome: SessionState,
) -> Result<()> {
    let from = session.state;
    session.state = outcome;
    session.updated_at = Utc::now();
    session.completed_at = Some(session.updated_at);
    store.put_session(session)?;

    store.insert_event(&Event {
        event_id: uuid::Uuid::new_v4(),
        ticket_id: None,
        session_id: Some(session.session_id),
        from_state: session_state_name(from),
        to_state: session_state_name(outcome),
        action: "build_finished".to_string(),
        actor: Actor::System,
        actor_id: None,
        metadata: serde_json::json!({}),
        created_at: Utc::now(),
    })?;

    let rooms = [
        Room::Session(session.session_id),
        Room::Tenant(session.tenant_id),
    ];
    bus.publish(
        &rooms,
        &BusEvent::new(
            EventKind::SessionState,
            serde_json::json!({
                "session_id": session.session_id,
                "from": from,
                "to": outcome,
                "action": "build_finished",
            }),
        ),
    );
    bus.publish(
        &rooms,
        &BusEvent::new(
            EventKind::BuildProgress,
            serde_json::json!({
                "session_id": session.session_id,
                "state": outcome,
                "progress": 100,
            }),
        ),
    );

    tracing::info!(
        session_id = %session.session_id,
        outcome = ?outcome,
        "Session build finished"
    );
    Ok(())
}

/// The cascade worker: consumes completion signals and drives unblocking
/// plus the session completion check.
pub struct CascadeWorker<S: Store + ?Sized> {
    store: std::sync::Arc<S>,
    bus: EventBus,
    rx: mpsc::UnboundedReceiver<CompletionSignal>,
}

impl<S: Store + ?Sized> CascadeWorker<S> {
    /// Create a worker over a signal channel.
    #[must_use]
    pub fn new(
        store: std::sync::Arc<S>,
        bus: EventBus,
        rx: mpsc::UnboundedReceiver<CompletionSignal>,
    ) -> Self {
        Self { store, bus, rx }
    }

    /// Process one signal.
    ///
    /// # Errors
    ///
    /// Returns an error if a store operation fails.
    pub fn handle(&self, signal: CompletionSignal) -> Result<()> {
        let Some(ticket) = self.store.get_ticket(&signal.ticket_id)? else {
            return Ok(());
        };

        if ticket.state == TicketState::Completed {
            unblock_descendants(&*self.store, &self.bus, &signal.ticket_id)?;
        }
        check_session_completion(&*self.store, &self.bus, &ticket.session_id)?;
        Ok(())
    }

    /// Process every signal currently queued; returns the count handled.
    pub fn drain_pending(&mut self) -> u32 {
        let mut handled = 0u32;
        while let Ok(signal) = self.rx.try_recv() {
            if let Err(err) = self.handle(signal) {
                tracing::error!(
                    ticket_id = %signal.ticket_id,
                    error = %err,
                    "Cascade signal failed"
                );
            }
            handled += 1;
        }
        handled
    }

    /// Run until the channel closes or shutdown flips.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                signal = self.rx.recv() => {
                    match signal {
                        Some(signal) => {
                            if let Err(err) = self.handle(signal) {
                                tracing::error!(
                                    ticket_id = %signal.ticket_id,
                                    error = %err,
                                    "Cascade signal failed"
                                );
                            }
                        }
                        None => return,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::debug!("Cascade worker stopping");
                        return;
                    }
                }
            }
        }
    }
}
