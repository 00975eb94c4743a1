//! Spec → ticket generator.
//!
//! Converts an approved specification into a dependency DAG of draft
//! tickets: one per feature, a verification ticket gated on every feature,
//! a packaging ticket gated on verification, and an epic roll-up that
//! depends on the leaves but never blocks work.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use swarm_core::{ProjectId, TicketId};
use swarm_store::{
    AcceptanceCriterion, AssigneeKind, CriterionStatus, Session, SpecDoc, Ticket, TicketKind,
    TicketState, VerificationStatus,
};

use crate::error::{HitlError, Result};

const FEATURE_PRIORITY_BASE: i32 = 10;
const VERIFICATION_PRIORITY: i32 = 50;
const PACKAGING_PRIORITY: i32 = 60;
const EPIC_PRIORITY: i32 = 100;

/// Produce the draft ticket plan for an approved spec.
#[must_use]
pub fn plan_tickets(session: &Session, spec: &SpecDoc, project_id: ProjectId) -> Vec<Ticket> {
    let now = Utc::now();
    let epic_id = TicketId::generate();

    let base = |ticket_id: TicketId, title: &str, description: &str, kind: TicketKind, priority: i32| Ticket {
        ticket_id,
        session_id: session.session_id,
        project_id,
        tenant_id: session.tenant_id,
        title: title.to_string(),
        description: description.to_string(),
        parent_id: Some(epic_id),
        priority,
        state: TicketState::Draft,
        kind,
        assignee_kind: AssigneeKind::Agent,
        assignee: None,
        vm_id: None,
        lease_expires_at: None,
        last_heartbeat_at: None,
        depends_on: Vec::new(),
        blocked_by: 0,
        branch_name: Some(branch_name(title, &ticket_id)),
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
    };

    let mut tickets = Vec::new();
    let mut feature_ids = Vec::new();

    for (index, feature) in spec.features.iter().enumerate() {
        let ticket_id = TicketId::generate();
        let mut ticket = base(
            ticket_id,
            &feature.name,
            &feature.description,
            TicketKind::Feature,
            FEATURE_PRIORITY_BASE + i32::try_from(index).unwrap_or(0),
        );
        ticket.acceptance_criteria = criteria(&feature.acceptance);
        feature_ids.push(ticket_id);
        tickets.push(ticket);
    }

    let verification_id = TicketId::generate();
    let mut verification = base(
        verification_id,
        "Verification",
        "Run the full verification suite over every delivered feature.",
        TicketKind::Verification,
        VERIFICATION_PRIORITY,
    );
    verification.depends_on.clone_from(&feature_ids);
    verification.acceptance_criteria = criteria(&spec.acceptance);
    tickets.push(verification);

    let packaging_id = TicketId::generate();
    let mut packaging = base(
        packaging_id,
        "Packaging",
        "Produce the packaged output bundle from the verified build.",
        TicketKind::Packaging,
        PACKAGING_PRIORITY,
    );
    packaging.depends_on.push(verification_id);
    tickets.push(packaging);

    // The epic depends on every leaf (tickets nothing else depends on), so
    // it resolves when the plan does; nothing ever depends on the epic.
    let referenced: HashSet<TicketId> = tickets
        .iter()
        .flat_map(|t| t.depends_on.iter().copied())
        .collect();
    let leaves: Vec<TicketId> = tickets
        .iter()
        .map(|t| t.ticket_id)
        .filter(|id| !referenced.contains(id))
        .collect();

    let mut epic = base(
        epic_id,
        &spec.title,
        &spec.summary,
        TicketKind::Epic,
        EPIC_PRIORITY,
    );
    epic.parent_id = None;
    epic.depends_on = leaves;
    tickets.push(epic);

    for ticket in &mut tickets {
        ticket.blocked_by = u32::try_from(ticket.depends_on.len()).unwrap_or(0);
    }

    tickets
}

fn criteria(texts: &[String]) -> Vec<AcceptanceCriterion> {
    texts
        .iter()
        .enumerate()
        .map(|(i, text)| AcceptanceCriterion {
            id: format!("AC-{}", i + 1),
            text: text.clone(),
            status: CriterionStatus::Blocked,
        })
        .collect()
}

fn branch_name(title: &str, ticket_id: &TicketId) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    let slug = &slug[..slug.len().min(24)];
    let short = &ticket_id.to_string()[..8];
    format!("swarm/{slug}-{short}")
}

/// Reject plans whose dependency edges do not form a DAG.
///
/// Runs at activation; a cycle is a generator bug and fails the build
/// start with a fatal reason.
///
/// # Errors
///
/// Returns `HitlError::DependencyCycle` when a cycle exists.
pub fn validate_dag(tickets: &[Ticket]) -> Result<()> {
    let ids: HashSet<TicketId> = tickets.iter().map(|t| t.ticket_id).collect();
    let mut in_degree: HashMap<TicketId, usize> = HashMap::new();
    let mut dependents: HashMap<TicketId, Vec<TicketId>> = HashMap::new();

    for ticket in tickets {
        let degree = ticket
            .depends_on
            .iter()
            .filter(|dep| ids.contains(dep))
            .count();
        in_degree.insert(ticket.ticket_id, degree);
        for dep in &ticket.depends_on {
            if ids.contains(dep) {
                dependents.entry(*dep).or_default().push(ticket.ticket_id);
            }
        }
    }

    let mut queue: VecDeque<TicketId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;

    while let Some(id) = queue.pop_front() {
        processed += 1;
        if let Some(children) = dependents.get(&id) {
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*child);
                    }
                }
            }
        }
    }

    if processed == tickets.len() {
        Ok(())
    } else {
        Err(HitlError::DependencyCycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use swarm_core::{SessionId, TenantId};
    use swarm_store::{GatheredContext, SessionState, SourceType, SpecFeature};

    fn session() -> Session {
        let now = Utc::now();
        Session {
            session_id: SessionId::generate(),
            tenant_id: TenantId::generate(),
            project_id: None,
            state: SessionState::Approved,
            project_name: "demo".into(),
            description: "desc".into(),
            gathered: GatheredContext::default(),
            spec: None,
            progress: 80,
            source: SourceType::Direct,
            repo_url: None,
            analysis: None,
            clarification_turns: 3,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn spec(features: usize) -> SpecDoc {
        SpecDoc {
            title: "Health endpoint".into(),
            summary: "Add /health returning 200".into(),
            goals: vec!["observability".into()],
            features: (0..features)
                .map(|i| SpecFeature {
                    name: format!("feature-{i}"),
                    description: format!("build feature {i}"),
                    acceptance: vec![format!("feature {i} works")],
                })
                .collect(),
            non_goals: vec![],
            risks: vec![],
            acceptance: vec!["service responds".into()],
        }
    }

    #[test]
    fn plan_shape_for_single_feature() {
        let tickets = plan_tickets(&session(), &spec(1), ProjectId::generate());

        // 1 feature + verification + packaging + epic.
        assert_eq!(tickets.len(), 4);

        let feature = tickets.iter().find(|t| t.kind == TicketKind::Feature).unwrap();
        let verification = tickets
            .iter()
            .find(|t| t.kind == TicketKind::Verification)
            .unwrap();
        let packaging = tickets
            .iter()
            .find(|t| t.kind == TicketKind::Packaging)
            .unwrap();
        let epic = tickets.iter().find(|t| t.kind == TicketKind::Epic).unwrap();

        assert!(feature.depends_on.is_empty());
        assert_eq!(verification.depends_on, vec![feature.ticket_id]);
        assert_eq!(packaging.depends_on, vec![verification.ticket_id]);
        // The epic depends on the one leaf and nothing depends on it.
        assert_eq!(epic.depends_on, vec![packaging.ticket_id]);
        assert!(tickets
            .iter()
            .all(|t| !t.depends_on.contains(&epic.ticket_id)));

        // Feature runs first by priority.
        assert!(feature.priority < verification.priority);
        assert!(verification.priority < packaging.priority);
    }

    #[test]
    fn acceptance_criteria_copied_from_spec() {
        let tickets = plan_tickets(&session(), &spec(2), ProjectId::generate());
        let feature = tickets.iter().find(|t| t.kind == TicketKind::Feature).unwrap();

        assert_eq!(feature.acceptance_criteria.len(), 1);
        assert_eq!(feature.acceptance_criteria[0].id, "AC-1");
        assert!(feature.acceptance_criteria[0].text.contains("works"));
    }

    #[test]
    fn all_tickets_start_draft() {
        let tickets = plan_tickets(&session(), &spec(3), ProjectId::generate());
        assert!(tickets.iter().all(|t| t.state == TicketState::Draft));
        assert!(tickets.iter().all(|t| t.attempt == 1));
    }

    #[test]
    fn branch_names_are_stable_slugs() {
        let tickets = plan_tickets(&session(), &spec(1), ProjectId::generate());
        let feature = tickets.iter().find(|t| t.kind == TicketKind::Feature).unwrap();
        let branch = feature.branch_name.as_deref().unwrap();
        assert!(branch.starts_with("swarm/feature-0-"));
    }

    #[test]
    fn generated_plan_is_a_dag() {
        let tickets = plan_tickets(&session(), &spec(4), ProjectId::generate());
        assert!(validate_dag(&tickets).is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut tickets = plan_tickets(&session(), &spec(2), ProjectId::generate());

        // Manufacture a cycle between the two feature tickets.
        let feature_ids: Vec<TicketId> = tickets
            .iter()
            .filter(|t| t.kind == TicketKind::Feature)
            .map(|t| t.ticket_id)
            .collect();
        for ticket in &mut tickets {
            if ticket.ticket_id == feature_ids[0] {
                ticket.depends_on.push(feature_ids[1]);
            } else if ticket.ticket_id == feature_ids[1] {
                ticket.depends_on.push(feature_ids[0]);
            }
        }

        assert!(matches!(
            validate_dag(&tickets),
            Err(HitlError::DependencyCycle)
        ));
    }
}
