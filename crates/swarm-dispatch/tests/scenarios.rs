//! End-to-end flows over the execution core: HITL session through
//! clarification, approval, build activation, dispatch, verification,
//! cascade, and session completion, with real storage and fake adapters.

use std::sync::Arc;

use swarm_adapters::{
    FakeVmBackend, RecordingVcs, ScriptedLlmClient, StaticVerifier, Verdict, VmBackend,
};
use swarm_bus::EventBus;
use swarm_core::{CoreConfig, SessionId, TicketId};
use swarm_dispatch::{
    AgentResult, CascadeWorker, CriterionUpdate, Dispatcher, ResultOutcome, ResultPipeline,
    StaleReclaimer, VmRegistry,
};
use swarm_hitl::{ApprovalContext, HitlService};
use swarm_store::{
    CriterionStatus, RocksStore, SessionState, SourceType, Store, Ticket, TicketKind, TicketPatch,
    TicketState,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct World {
    store: Arc<RocksStore>,
    vm: Arc<FakeVmBackend>,
    verifier: Arc<StaticVerifier>,
    vcs: Arc<RecordingVcs>,
    llm: Arc<ScriptedLlmClient>,
    hitl: HitlService<RocksStore, ScriptedLlmClient>,
    dispatcher: Dispatcher<RocksStore>,
    pipeline: ResultPipeline<RocksStore>,
    reclaimer: StaleReclaimer<RocksStore>,
    worker: CascadeWorker<RocksStore>,
    _dir: TempDir,
}

fn world(config: CoreConfig) -> World {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(RocksStore::open(dir.path()).unwrap());
    let bus = EventBus::with_defaults();
    let vm = Arc::new(FakeVmBackend::new());
    let verifier = Arc::new(StaticVerifier::passing());
    let vcs = Arc::new(RecordingVcs::new());
    let llm = Arc::new(ScriptedLlmClient::new());
    let registry = Arc::new(VmRegistry::new());
    let (tx, rx) = mpsc::unbounded_channel();

    let vm_dyn: Arc<dyn VmBackend> = vm.clone();
    let hitl = HitlService::new(
        Arc::clone(&store),
        Arc::clone(&llm),
        bus.clone(),
        config.clone(),
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&store),
        Arc::clone(&vm_dyn),
        bus.clone(),
        Arc::clone(&registry),
        config.clone(),
        tx.clone(),
    );
    let pipeline = ResultPipeline::new(
        Arc::clone(&store),
        bus.clone(),
        verifier.clone(),
        vcs.clone(),
        Arc::clone(&vm_dyn),
        Arc::clone(&registry),
        config.clone(),
        tx.clone(),
    );
    let reclaimer = StaleReclaimer::new(
        Arc::clone(&store),
        vm_dyn,
        bus.clone(),
        Arc::clone(&registry),
        config,
        tx,
    );
    let worker = CascadeWorker::new(Arc::clone(&store), bus, rx);

    World {
        store,
        vm,
        verifier,
        vcs,
        llm,
        hitl,
        dispatcher,
        pipeline,
        reclaimer,
        worker,
        _dir: dir,
    }
}

const FULL_COVERAGE_REPLY: &str = r#"{"message": "All set.", "gathered": {
    "project_type": {"kind": "api", "platform": "web", "audience": "devs"},
    "tech_stack": {"language": "rust", "framework": "axum", "storage": "rocksdb"},
    "scale": {"users": "100", "availability": "99.9"},
    "features": {"core": "health endpoint", "integrations": "none"},
    "constraints": {"timeline": "1 week", "compliance": "none"}
}, "progress": 100, "ready_for_spec": true, "next_category": null}"#;

const SPEC_REPLY: &str = r#"{
    "title": "Health endpoint",
    "summary": "Add /health returning 200",
    "goals": ["observability"],
    "features": [{"name": "health", "description": "GET /health returns 200", "acceptance": ["returns 200"]}],
    "non_goals": [],
    "risks": [],
    "acceptance": ["service responds"]
}"#;

/// Drive a session from description to an activated build.
async fn activate_build(w: &World) -> SessionId {
    let session = w
        .hitl
        .create_session(
            swarm_core::TenantId::generate(),
            "demo",
            "Add /health endpoint returning 200",
            SourceType::Direct,
        )
        .unwrap();
    w.llm.push_reply(FULL_COVERAGE_REPLY);
    w.hitl
        .respond(&session.session_id, "please build it")
        .await
        .unwrap();
    w.llm.push_reply(SPEC_REPLY);
    w.hitl.generate_spec(&session.session_id).await.unwrap();
    w.hitl
        .approve(&session.session_id, &ApprovalContext::default())
        .unwrap();
    w.hitl
        .start_build(&session.session_id, true, &ApprovalContext::default())
        .unwrap();
    session.session_id
}

fn ticket_of_kind(w: &World, session_id: &SessionId, kind: TicketKind) -> Ticket {
    w.store
        .list_tickets_by_session(session_id)
        .unwrap()
        .into_iter()
        .find(|t| t.kind == kind)
        .unwrap()
}

fn satisfied_result(agent_id: &str, criteria: &[String]) -> AgentResult {
    AgentResult {
        agent_id: agent_id.to_string(),
        success: true,
        summary: Some("implemented".into()),
        pr_url: None,
        error: None,
        criteria_status: criteria
            .iter()
            .map(|id| CriterionUpdate {
                id: id.clone(),
                status: CriterionStatus::Satisfied,
            })
            .collect(),
        files_changed: vec!["src/health.rs".into()],
    }
}

/// Let the claimed ticket's agent acknowledge and post a passing result.
async fn run_claimed_to_completion(w: &mut World, ticket: &Ticket) -> ResultOutcome {
    let agent_id = w
        .store
        .get_ticket(&ticket.ticket_id)
        .unwrap()
        .unwrap()
        .assignee
        .unwrap();
    let acked = w
        .dispatcher
        .claim_for_agent(&agent_id, None)
        .unwrap()
        .unwrap();
    assert_eq!(acked.state, TicketState::InProgress);

    let criteria: Vec<String> = acked
        .acceptance_criteria
        .iter()
        .map(|c| c.id.clone())
        .collect();
    let outcome = w
        .pipeline
        .process_agent_result(&acked.ticket_id, &satisfied_result(&agent_id, &criteria))
        .await
        .unwrap();
    w.worker.drain_pending();
    outcome
}

/// Backoff deadlines are minutes long; tests clear them between attempts.
fn clear_backoff(w: &World, ticket_id: &TicketId) {
    w.store
        .update_ticket(
            ticket_id,
            TicketPatch {
                retry_after: Some(None),
                ..TicketPatch::default()
            },
            None,
        )
        .unwrap();
}

#[tokio::test]
async fn scenario_happy_single_ticket() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;

    // Activation: feature ready, verification/packaging/epic blocked.
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);
    assert_eq!(feature.state, TicketState::Ready);
    assert_eq!(
        ticket_of_kind(&w, &session_id, TicketKind::Verification).state,
        TicketState::Blocked
    );

    // The dispatcher claims the feature first and spawns its VM.
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 1);
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(claimed.state, TicketState::Claimed);
    assert_eq!(w.vm.spawned().len(), 1);

    let outcome = run_claimed_to_completion(&mut w, &claimed).await;
    assert_eq!(outcome, ResultOutcome::Completed);

    // PR persisted; cascade opened verification.
    let done = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(done.pr_url.as_deref(), Some("https://git.example/pr/1"));
    let verification = ticket_of_kind(&w, &session_id, TicketKind::Verification);
    assert_eq!(verification.state, TicketState::Ready);

    // Verification, then packaging, then the epic roll-up.
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 1);
    let verification = w.store.get_ticket(&verification.ticket_id).unwrap().unwrap();
    run_claimed_to_completion(&mut w, &verification).await;

    let packaging = ticket_of_kind(&w, &session_id, TicketKind::Packaging);
    assert_eq!(packaging.state, TicketState::Ready);
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 1);
    let packaging = w.store.get_ticket(&packaging.ticket_id).unwrap().unwrap();
    run_claimed_to_completion(&mut w, &packaging).await;

    // The epic completed without ever executing.
    let epic = ticket_of_kind(&w, &session_id, TicketKind::Epic);
    assert_eq!(epic.state, TicketState::Completed);

    // Every ticket terminal with completions: the session completed.
    let session = w.store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Completed);
}

#[tokio::test]
async fn scenario_verifier_rejection_with_retry() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.verifier
        .push_verdict(Verdict::failed("missing 200 case"));

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    let agent_id = claimed.assignee.clone().unwrap();
    w.dispatcher.claim_for_agent(&agent_id, None).unwrap();

    // First attempt: criterion only partial, verifier rejects.
    let mut result = satisfied_result(&agent_id, &["AC-1".to_string()]);
    result.criteria_status[0].status = CriterionStatus::Partial;
    let outcome = w
        .pipeline
        .process_agent_result(&feature.ticket_id, &result)
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Requeued);
    w.worker.drain_pending();

    let requeued = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(requeued.state, TicketState::Ready);
    assert_eq!(requeued.attempt, 2);
    assert_eq!(requeued.rejection_count, 1);
    // The feedback rides along for the next claim.
    assert_eq!(
        requeued.outputs.as_ref().unwrap()["verifier_feedback"],
        "missing 200 case"
    );

    // Second attempt passes and the flow finishes as in the happy path.
    clear_backoff(&w, &feature.ticket_id);
    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    let outcome = run_claimed_to_completion(&mut w, &claimed).await;
    assert_eq!(outcome, ResultOutcome::Completed);

    let done = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(done.state, TicketState::Completed);
    assert!(done.pr_url.is_some());
}

#[tokio::test]
async fn scenario_vm_crash_reclaim_and_retry() {
    // Zero stale threshold: the claim-time heartbeat is already stale.
    let config = CoreConfig {
        stale_threshold_ms: 0,
        ..CoreConfig::default()
    };
    let mut w = world(config);
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(claimed.state, TicketState::Claimed);

    // Heartbeats never arrive; the reclaimer takes the lease back.
    let reclaimed = w.reclaimer.sweep().await.unwrap();
    assert_eq!(reclaimed, 1);

    let requeued = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(requeued.state, TicketState::Ready);
    assert_eq!(requeued.attempt, 2);
    assert!(requeued.assignee.is_none());
    // The dead VM was torn down.
    assert_eq!(w.vm.torn_down().len(), 1);

    // A fresh VM picks it up and completes normally.
    clear_backoff(&w, &feature.ticket_id);
    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    let outcome = run_claimed_to_completion(&mut w, &claimed).await;
    assert_eq!(outcome, ResultOutcome::Completed);
    assert_eq!(w.vm.spawned().len(), 2);
}

#[tokio::test]
async fn scenario_contested_claim() {
    let w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;

    // One ready ticket, two agents pull simultaneously.
    let first = w.dispatcher.claim_for_agent("agent-a", None).unwrap();
    let second = w.dispatcher.claim_for_agent("agent-b", None).unwrap();

    assert!(first.is_some());
    assert!(second.is_none());

    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);
    assert_eq!(feature.state, TicketState::InProgress);
    assert_eq!(feature.assignee.as_deref(), Some("agent-a"));

    // The claim event appears exactly once in the log.
    let events = w.store.list_events_by_ticket(&feature.ticket_id).unwrap();
    assert_eq!(events.iter().filter(|e| e.action == "claim").count(), 1);
}

#[tokio::test]
async fn scenario_user_cancels_mid_build() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();

    let cancelled = w
        .dispatcher
        .cancel_ticket(&feature.ticket_id, "user-1")
        .await
        .unwrap();
    assert_eq!(cancelled.state, TicketState::Cancelled);
    // The bound VM was torn down regardless.
    assert_eq!(w.vm.torn_down().len(), 1);

    // Its successor stays blocked forever, and with nothing able to make
    // progress the session fails.
    w.worker.drain_pending();
    let verification = ticket_of_kind(&w, &session_id, TicketKind::Verification);
    assert_eq!(verification.state, TicketState::Blocked);

    let session = w.store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Failed);
}

#[tokio::test]
async fn scenario_post_cancel_result_is_discarded() {
    let w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    let agent_id = claimed.assignee.clone().unwrap();
    w.dispatcher.claim_for_agent(&agent_id, None).unwrap();

    w.dispatcher
        .cancel_ticket(&feature.ticket_id, "user-1")
        .await
        .unwrap();

    // The agent's late result changes nothing.
    let outcome = w
        .pipeline
        .process_agent_result(
            &feature.ticket_id,
            &satisfied_result(&agent_id, &["AC-1".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Discarded);
    assert_eq!(
        w.store.get_ticket(&feature.ticket_id).unwrap().unwrap().state,
        TicketState::Cancelled
    );
}

#[tokio::test]
async fn scenario_revision_adds_criteria_to_build() {
    let w = world(CoreConfig::default());

    let session = w
        .hitl
        .create_session(
            swarm_core::TenantId::generate(),
            "demo",
            "Add /health endpoint returning 200",
            SourceType::Direct,
        )
        .unwrap();
    w.llm.push_reply(FULL_COVERAGE_REPLY);
    w.hitl
        .respond(&session.session_id, "please build it")
        .await
        .unwrap();
    w.llm.push_reply(SPEC_REPLY);
    w.hitl.generate_spec(&session.session_id).await.unwrap();

    // User asks for rate limiting; the revised spec carries it.
    w.llm.push_reply(
        r#"{
            "title": "Health endpoint",
            "summary": "Add /health returning 200 with rate limiting",
            "features": [
                {"name": "health", "description": "GET /health", "acceptance": ["returns 200"]},
                {"name": "rate-limit", "description": "limit request rate", "acceptance": ["returns 429 over budget"]}
            ]
        }"#,
    );
    w.hitl
        .request_revision(
            &session.session_id,
            "add rate limiting",
            &ApprovalContext::default(),
        )
        .await
        .unwrap();
    w.hitl
        .approve(&session.session_id, &ApprovalContext::default())
        .unwrap();
    let summary = w
        .hitl
        .start_build(&session.session_id, true, &ApprovalContext::default())
        .unwrap();

    // 2 features + verification + packaging + epic, both features open.
    assert_eq!(summary.total, 5);
    assert_eq!(summary.eligible, 2);

    let tickets = w.store.list_tickets_by_session(&session.session_id).unwrap();
    assert!(tickets.iter().any(|t| {
        t.acceptance_criteria
            .iter()
            .any(|c| c.text.contains("429"))
    }));
}

#[tokio::test]
async fn attempts_exhaust_to_failed_session() {
    let config = CoreConfig {
        max_attempts: 1,
        ..CoreConfig::default()
    };
    let mut w = world(config);
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.verifier.push_verdict(Verdict::failed("wrong"));

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    let agent_id = claimed.assignee.clone().unwrap();
    w.dispatcher.claim_for_agent(&agent_id, None).unwrap();

    let outcome = w
        .pipeline
        .process_agent_result(
            &feature.ticket_id,
            &satisfied_result(&agent_id, &["AC-1".to_string()]),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ResultOutcome::Failed);

    w.worker.drain_pending();

    let session = w.store.get_session(&session_id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Failed);
}

#[tokio::test]
async fn fleet_cap_is_respected() {
    let config = CoreConfig {
        max_fleet: 2,
        ..CoreConfig::default()
    };
    let w = world(config);

    // A plan with three parallel features.
    let session = w
        .hitl
        .create_session(
            swarm_core::TenantId::generate(),
            "demo",
            "Add /health endpoint returning 200",
            SourceType::Direct,
        )
        .unwrap();
    w.llm.push_reply(FULL_COVERAGE_REPLY);
    w.hitl
        .respond(&session.session_id, "please build it")
        .await
        .unwrap();
    w.llm.push_reply(
        r#"{
            "title": "Trio",
            "summary": "three features",
            "features": [
                {"name": "a", "description": "a", "acceptance": ["a"]},
                {"name": "b", "description": "b", "acceptance": ["b"]},
                {"name": "c", "description": "c", "acceptance": ["c"]}
            ]
        }"#,
    );
    w.hitl.generate_spec(&session.session_id).await.unwrap();
    w.hitl
        .approve(&session.session_id, &ApprovalContext::default())
        .unwrap();
    let summary = w
        .hitl
        .start_build(&session.session_id, true, &ApprovalContext::default())
        .unwrap();
    assert_eq!(summary.eligible, 3);

    // Only two VMs fit in the fleet; a second cycle adds nothing.
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 2);
    assert_eq!(w.store.count_in_flight().unwrap(), 2);
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 0);
    assert_eq!(w.store.count_in_flight().unwrap(), 2);
}

#[tokio::test]
async fn event_log_replays_to_current_state() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    run_claimed_to_completion(&mut w, &claimed).await;

    let events = w.store.list_events_by_ticket(&feature.ticket_id).unwrap();
    let transitions: Vec<(&str, &str)> = events
        .iter()
        .filter_map(|e| {
            Some((e.from_state.as_deref()?, e.to_state.as_deref()?))
        })
        .collect();

    // The log is a connected path from draft to the current state.
    assert_eq!(transitions.first().unwrap().0, "draft");
    for pair in transitions.windows(2) {
        assert_eq!(pair[0].1, pair[1].0);
    }
    assert_eq!(transitions.last().unwrap().1, "completed");
    assert_eq!(
        w.store.get_ticket(&feature.ticket_id).unwrap().unwrap().state,
        TicketState::Completed
    );
}

#[tokio::test]
async fn cascade_is_idempotent() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    run_claimed_to_completion(&mut w, &claimed).await;

    let verification = ticket_of_kind(&w, &session_id, TicketKind::Verification);
    assert_eq!(verification.state, TicketState::Ready);

    // A second cascade for the same completion changes nothing.
    let opened = swarm_dispatch::unblock_descendants(
        &*w.store,
        &EventBus::with_defaults(),
        &feature.ticket_id,
    )
    .unwrap();
    assert_eq!(opened, 0);
    assert_eq!(
        ticket_of_kind(&w, &session_id, TicketKind::Verification).state,
        TicketState::Ready
    );
}

#[tokio::test]
async fn release_returns_ticket_without_attempt_penalty() {
    let w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    let acked = w.dispatcher.claim_for_agent("agent-a", None).unwrap().unwrap();
    assert_eq!(acked.ticket_id, feature.ticket_id);

    let released = w
        .dispatcher
        .release_ticket(&feature.ticket_id, "agent-a")
        .await
        .unwrap();
    assert_eq!(released.state, TicketState::Ready);
    assert_eq!(released.attempt, 1);
    assert!(released.assignee.is_none());

    // Someone else can claim it immediately.
    assert!(w.dispatcher.claim_for_agent("agent-b", None).unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn spawn_failure_consumes_attempt() {
    let w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    // Spawn fails past the retry budget.
    w.vm.fail_next_spawns(10);
    assert_eq!(w.dispatcher.dispatch_once().await.unwrap(), 0);

    let requeued = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    assert_eq!(requeued.state, TicketState::Ready);
    assert_eq!(requeued.attempt, 2);
    assert!(requeued
        .error_message
        .as_deref()
        .unwrap()
        .contains("vm spawn failed"));
}

#[tokio::test]
async fn vcs_records_pr_for_completed_feature() {
    let mut w = world(CoreConfig::default());
    let session_id = activate_build(&w).await;
    let feature = ticket_of_kind(&w, &session_id, TicketKind::Feature);

    w.dispatcher.dispatch_once().await.unwrap();
    let claimed = w.store.get_ticket(&feature.ticket_id).unwrap().unwrap();
    run_claimed_to_completion(&mut w, &claimed).await;

    let operations = w.vcs.operations();
    assert!(operations.iter().any(|op| op.starts_with("pr:swarm/health")));
}
