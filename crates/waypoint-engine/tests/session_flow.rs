use std::sync::Arc;
use std::time::Duration;

use waypoint_core::config::AppConfig;
use waypoint_core::event::EventBus;
use waypoint_core::state::{RunPhase, Severity, CLASSIFY, FINALIZE};
use waypoint_core::traits::CheckpointStore;
use waypoint_core::types::{Request, ResponseStatus, SessionId, WorkflowType};
use waypoint_core::WaypointError;
use waypoint_engine::{
    ComplianceEngine, Edge, GraphCoordinator, Node, SessionManager, WorkflowClassifier,
    WorkflowGraph,
};
use waypoint_gateway::{AgentGateway, AgentRegistry};
use waypoint_store::{JsonlAuditSink, SqliteCheckpointStore};
use waypoint_test_utils::{temp_workspace, FailingCheckpointStore, MockAgent, MockReply};

const ESSAY: &str = "Here is your essay: Ever since I was seven, I have spent every summer on \
    my grandmother's fishing boat learning how tides, weather and patience shape a life, and \
    that is why I want to study oceanography at your university.";

fn coordinator(
    config: &AppConfig,
    agents: Vec<MockAgent>,
    store: Arc<dyn CheckpointStore>,
) -> GraphCoordinator {
    let mut registry = AgentRegistry::new();
    for agent in agents {
        registry.register(agent);
    }
    GraphCoordinator::new(
        Arc::new(AgentGateway::new(registry, config.gateway.clone())),
        Arc::new(ComplianceEngine::with_builtins(&config.compliance)),
        store,
        Arc::new(EventBus::default()),
        config,
    )
}

fn manager(config: &AppConfig, coordinator: GraphCoordinator) -> SessionManager {
    SessionManager::new(
        WorkflowClassifier::with_defaults(),
        coordinator,
        Arc::new(EventBus::default()),
        config,
    )
}

fn sqlite(config: &AppConfig) -> Arc<SqliteCheckpointStore> {
    Arc::new(SqliteCheckpointStore::open(&config.checkpoint_path()).unwrap())
}

fn request(workflow: WorkflowType, query: &str) -> Request {
    Request::new("user-1", query).with_context("workflow", workflow.as_str())
}

#[tokio::test]
async fn essay_handoff_is_replaced_by_fallback() {
    let (_dir, config) = temp_workspace();
    let audit = Arc::new(JsonlAuditSink::open(&config.audit_path()).unwrap());
    let coord = coordinator(&config, vec![MockAgent::text("essay-guidance", ESSAY)], sqlite(&config))
        .with_audit(audit);
    let mgr = manager(&config, coord);

    let response = mgr
        .handle(request(WorkflowType::ComplianceSensitive, "write my college essay"))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::HumanReviewRequired);
    assert_eq!(response.body, config.engine.fallback_response);
    assert!(!response.body.contains("oceanography"));
    assert!(response
        .violations
        .iter()
        .any(|v| v.rule_id == "content-generation" && v.severity == Severity::Critical));

    let audit_log = std::fs::read_to_string(config.audit_path()).unwrap();
    let records: Vec<serde_json::Value> = audit_log
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), response.violations.len());
    assert_eq!(records[0]["session_id"], response.session.as_str());
    assert_eq!(records[0]["step_index"], 2);
}

#[tokio::test]
async fn length_limit_scenario_needs_review() {
    let (_dir, config) = temp_workspace();
    let guidance = "Tighten the opening and cut the second anecdote. \
        You can expand it to 250 words so the story has room. This is guidance only.";
    let agent = MockAgent::text("essay-guidance", guidance);
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));

    let response = mgr
        .handle(request(WorkflowType::ComplianceSensitive, "optimize my application text"))
        .await
        .unwrap();

    assert_eq!(agent.call_count(), 1);
    assert_eq!(response.workflow, Some(WorkflowType::ComplianceSensitive));
    assert_eq!(response.violations.len(), 1);
    assert_eq!(response.violations[0].rule_id, "length-limit");
    assert_eq!(response.violations[0].severity, Severity::Critical);
    assert!(response.violations[0].span.contains("(limit 200)"));
    assert_eq!(response.status, ResponseStatus::HumanReviewRequired);
    assert_eq!(response.body, config.engine.fallback_response);
}

#[tokio::test]
async fn compliant_guidance_completes() {
    let (_dir, config) = temp_workspace();
    let guidance = "Open with the moment you changed your mind, and keep it under 200 words. \
        This is guidance only.";
    let mgr = manager(
        &config,
        coordinator(&config, vec![MockAgent::text("essay-guidance", guidance)], sqlite(&config)),
    );

    let response = mgr
        .handle(request(WorkflowType::ComplianceSensitive, "improve my personal statement"))
        .await
        .unwrap();

    assert_eq!(response.status, ResponseStatus::Completed);
    assert_eq!(response.body, guidance);
    assert!(response.violations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn mandatory_timeout_is_never_completed() {
    let (_dir, config) = temp_workspace();
    let agent = MockAgent::hanging("maintenance");
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));

    let response = mgr
        .handle(request(WorkflowType::Maintenance, "prune old backups"))
        .await
        .unwrap();

    assert_eq!(agent.call_count(), 2);
    assert_eq!(response.status, ResponseStatus::HumanReviewRequired);
    let state = mgr.inspect(&response.session, None).await.unwrap();
    assert_eq!(state.phase, RunPhase::Suspended);
    assert!(state.failed_roles().iter().any(|r| r.as_str() == "maintenance"));
}

#[tokio::test]
async fn looping_graph_is_bounded() {
    let (_dir, mut config) = temp_workspace();
    config.engine.max_steps = 4;
    let agent = MockAgent::text("general", "partial answer");
    let looping = WorkflowGraph::new(
        WorkflowType::General,
        vec![Node::new("poll", &["general"])],
        vec![Edge::always(CLASSIFY, "poll"), Edge::always("poll", "poll")],
    );
    let coord = coordinator(&config, vec![agent.clone()], sqlite(&config))
        .with_graph(looping)
        .unwrap();
    let mgr = manager(&config, coord);

    let response = mgr.handle(request(WorkflowType::General, "status?")).await.unwrap();

    assert_eq!(response.status, ResponseStatus::Completed);
    assert!(response.degraded);
    assert_eq!(agent.call_count(), 3);
    assert_eq!(response.steps, 5);
}

#[tokio::test]
async fn concurrent_requests_on_one_session_are_busy() {
    let (_dir, config) = temp_workspace();
    let agent = MockAgent::text("maintenance", "Vacuum completed.").with_delay(Duration::from_millis(200));
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));
    let sid = SessionId::from_string("shared");

    let (first, second) = tokio::join!(
        mgr.handle(request(WorkflowType::Maintenance, "vacuum the db").with_session(sid.clone())),
        mgr.handle(request(WorkflowType::Maintenance, "vacuum again").with_session(sid.clone())),
    );

    assert_eq!(first.unwrap().status, ResponseStatus::Completed);
    assert!(matches!(second, Err(WaypointError::SessionBusy(s)) if s == sid));
    assert_eq!(agent.call_count(), 1);
}

#[tokio::test]
async fn waiting_for_the_lock_serializes_requests() {
    let (_dir, mut config) = temp_workspace();
    config.session.lock_wait_ms = 5_000;
    let agent = MockAgent::text("maintenance", "Done.").with_delay(Duration::from_millis(50));
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));
    let sid = SessionId::from_string("shared");

    let (first, second) = tokio::join!(
        mgr.handle(request(WorkflowType::Maintenance, "vacuum the db").with_session(sid.clone())),
        mgr.handle(request(WorkflowType::Maintenance, "vacuum again").with_session(sid.clone())),
    );

    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(agent.call_count(), 2);
    assert!(second.steps > first.steps);

    let steps: Vec<u64> = mgr
        .history(&sid)
        .await
        .unwrap()
        .iter()
        .map(|c| c.step_index)
        .collect();
    assert_eq!(steps, (1..=6).collect::<Vec<u64>>());
}

#[tokio::test]
async fn different_sessions_run_independently() {
    let (_dir, config) = temp_workspace();
    let agent = MockAgent::text("maintenance", "Done.").with_delay(Duration::from_millis(50));
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));

    let (a, b) = tokio::join!(
        mgr.handle(request(WorkflowType::Maintenance, "a").with_session(SessionId::from_string("a"))),
        mgr.handle(request(WorkflowType::Maintenance, "b").with_session(SessionId::from_string("b"))),
    );

    assert_eq!(a.unwrap().status, ResponseStatus::Completed);
    assert_eq!(b.unwrap().status, ResponseStatus::Completed);
}

#[tokio::test]
async fn deadline_cancels_and_leaves_resumable_state() {
    let (_dir, config) = temp_workspace();
    let agent = MockAgent::text("maintenance", "Backup restored.").with_script(vec![MockReply::Hang]);
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));
    let sid = SessionId::from_string("slow");

    let response = mgr
        .respond(
            request(WorkflowType::Maintenance, "restore last night's backup")
                .with_session(sid.clone())
                .with_deadline(Duration::from_millis(100)),
        )
        .await;

    assert_eq!(response.status, ResponseStatus::Cancelled);
    assert_eq!(response.session, sid);
    let resumable = mgr.inspect(&sid, None).await.unwrap();
    assert_eq!(resumable.step, 1);
    assert_eq!(resumable.current_node, "maintain");
    assert_eq!(mgr.history(&sid).await.unwrap().len(), 1);

    let resumed = mgr
        .handle(request(WorkflowType::Maintenance, "restore last night's backup").with_session(sid.clone()))
        .await
        .unwrap();

    assert_eq!(resumed.status, ResponseStatus::Completed);
    assert_eq!(resumed.body, "Backup restored.");
    let state = mgr.inspect(&sid, None).await.unwrap();
    assert_eq!(state.completed_steps, vec!["classify", "maintain", FINALIZE]);
}

#[tokio::test]
async fn checkpoint_failure_is_retried_once_then_surfaced() {
    let (_dir, config) = temp_workspace();
    let store = Arc::new(FailingCheckpointStore::new(sqlite(&config), 1));
    let mgr = manager(
        &config,
        coordinator(&config, vec![MockAgent::text("maintenance", "ok")], store.clone()),
    );
    let sid = SessionId::from_string("flaky");

    let response = mgr
        .respond(request(WorkflowType::Maintenance, "reindex search").with_session(sid.clone()))
        .await;

    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.session, sid);
    assert!(response.body.contains("Checkpoint write failed"));
    assert_eq!(store.attempts(), 3);

    let resumable = mgr.inspect(&sid, None).await.unwrap();
    assert_eq!(resumable.step, 1);
}

#[tokio::test(start_paused = true)]
async fn hanging_checkpoint_write_is_bounded() {
    let (_dir, config) = temp_workspace();
    let store = Arc::new(FailingCheckpointStore::new(sqlite(&config), 0).hanging());
    let mgr = manager(
        &config,
        coordinator(&config, vec![MockAgent::text("maintenance", "ok")], store.clone()),
    );

    let err = mgr
        .handle(request(WorkflowType::Maintenance, "reindex search"))
        .await
        .unwrap_err();

    match err {
        WaypointError::CheckpointWriteFailed { step, reason, .. } => {
            assert_eq!(step, 1);
            assert!(reason.contains("timed out"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.attempts(), 2);
}

#[tokio::test]
async fn checkpoints_round_trip_and_steps_increase() {
    let (_dir, config) = temp_workspace();
    let store = sqlite(&config);
    let mgr = manager(
        &config,
        coordinator(
            &config,
            vec![
                MockAgent::text("knowledge", "Exports run nightly."),
                MockAgent::text("research", "Since March they include VAT."),
            ],
            store.clone(),
        ),
    );
    let sid = SessionId::from_string("history");

    for query in ["when do exports run", "what do they include"] {
        mgr.handle(request(WorkflowType::UserQuery, query).with_session(sid.clone()))
            .await
            .unwrap();
    }

    let history = mgr.history(&sid).await.unwrap();
    assert!(history.windows(2).all(|w| w[0].step_index < w[1].step_index));
    for checkpoint in &history {
        let state = checkpoint.state().unwrap();
        assert_eq!(state.step, checkpoint.step_index);
        assert_eq!(
            store.load(&sid, Some(checkpoint.step_index)).await.unwrap(),
            state
        );
    }

    let latest = mgr.inspect(&sid, None).await.unwrap();
    assert_eq!(latest.turn, 2);
    assert_eq!(latest.conversation.len(), 2);
    assert_eq!(Some(latest.step), history.last().map(|c| c.step_index));
}

#[tokio::test]
async fn ambiguous_request_falls_back_to_general() {
    let (_dir, config) = temp_workspace();
    let agent = MockAgent::text("general", "Happy to help.");
    let mgr = manager(&config, coordinator(&config, vec![agent.clone()], sqlite(&config)));

    let response = mgr.handle(Request::new("user-1", "hello")).await.unwrap();

    assert_eq!(response.workflow, Some(WorkflowType::General));
    assert_eq!(response.body, "Happy to help.");
    assert_eq!(agent.call_count(), 1);
}
