use std::sync::Arc;
use std::time::Duration;

use flowscope_protocol::{Resource, Snapshot, WorkflowStatus};
use flowscope_sync::memory::{MemorySnapshots, ScriptedPush};
use flowscope_sync::{
    ConnectionState, FreshnessMode, PushFrame, Session, SessionView, SyncConfig, TransportError,
};
use serde_json::{json, Value};

fn seeded_snapshots() -> Arc<MemorySnapshots> {
    Arc::new(
        MemorySnapshots::new()
            .with(Resource::Metrics, json!({"active_workflows": 2, "region": "eu"}))
            .with(
                Resource::Workflows,
                json!([
                    {"id": "wf-1", "name": "Ingest", "status": "running"},
                    {"id": "wf-2", "name": "Report", "status": "idle"}
                ]),
            )
            .with(
                Resource::Traces,
                json!([{"id": "tr-1", "workflow_id": "wf-1", "start_time": 1_700_000_000_000i64}]),
            ),
    )
}

fn frame(kind: &str, payload: Value) -> PushFrame {
    PushFrame::new(
        Some(kind),
        json!({"type": kind, "payload": payload, "timestamp": "2024-05-01T10:00:00Z"}).to_string(),
    )
}

async fn until(session: &Session, pred: impl Fn(&SessionView) -> bool) -> SessionView {
    let mut changes = session.changes();
    loop {
        let view = session.view();
        if pred(&view) {
            return view;
        }
        tokio::time::timeout(Duration::from_secs(5), changes.changed())
            .await
            .expect("session changed in time")
            .expect("session alive");
    }
}

#[tokio::test]
async fn refresh_with_one_failed_resource_keeps_prior_value() {
    let snapshots = seeded_snapshots();
    let session = Session::create(
        SyncConfig::default(),
        snapshots.clone(),
        Arc::new(ScriptedPush::new()),
    );
    assert!(session.refresh_all().await.is_complete());
    assert!(session.view().error.is_none());

    snapshots.fail(Resource::Metrics, TransportError::Status(503));
    snapshots.set(Resource::Workflows, json!([{"id": "wf-3"}]));
    let report = session.refresh_all().await;
    assert!(report.failed(Resource::Metrics));
    assert_eq!(report.applied, vec![Resource::Workflows, Resource::Traces]);

    let view = session.view();
    assert_eq!(view.metrics.as_ref().and_then(|m| m.active_workflows), Some(2));
    assert_eq!(view.workflows.len(), 1);
    assert_eq!(view.workflows[0].id, "wf-3");
    assert!(!view.loading);
    let error = view.error.expect("session error");
    assert!(error.contains("metrics"), "{error}");

    snapshots.set(Resource::Metrics, json!({"active_workflows": 0}));
    session.refresh_all().await;
    assert!(session.view().error.is_none());
}

#[tokio::test]
async fn snapshot_values_read_back_unchanged() {
    let workflows = json!([
        {"id": "wf-1", "name": "Ingest", "status": "running", "nodes": [], "owner": "ops"},
        {
            "id": "wf-2",
            "status": "paused",
            "nodes": [{"id": "n-1", "name": "fetch", "status": "completed", "retries": 2}],
            "labels": {"team": "data"}
        }
    ]);
    let metrics = json!({"active_workflows": 2, "success_rate": 97.5, "region": "eu"});
    let snapshots = Arc::new(
        MemorySnapshots::new()
            .with(Resource::Workflows, workflows.clone())
            .with(Resource::Metrics, metrics.clone()),
    );
    let session = Session::create(
        SyncConfig::default(),
        snapshots,
        Arc::new(ScriptedPush::new()),
    );
    session.refresh_all().await;

    let view = session.view();
    assert_eq!(serde_json::to_value(&view.workflows).unwrap(), workflows);
    assert_eq!(serde_json::to_value(&view.metrics).unwrap(), metrics);
}

#[tokio::test]
async fn loosely_typed_snapshot_values_read_back_as_typed_equals() {
    let workflows = json!([{"id": 7, "status": "something-new"}]);
    let snapshots = Arc::new(MemorySnapshots::new().with(Resource::Workflows, workflows.clone()));
    let session = Session::create(
        SyncConfig::default(),
        snapshots,
        Arc::new(ScriptedPush::new()),
    );
    session.refresh_all().await;

    let view = session.view();
    let expected = Snapshot::from_value(Resource::Workflows, workflows).unwrap();
    assert_eq!(Snapshot::Workflows(view.workflows.clone()), expected);
    assert_eq!(view.workflows[0].id, "7");
    assert_eq!(view.workflows[0].status, WorkflowStatus::Unknown);
}

#[tokio::test]
async fn pushed_messages_merge_into_the_snapshot() {
    let push = Arc::new(ScriptedPush::new().then_hold(vec![
        frame("workflow", json!({"id": "wf-1", "name": "Ingest", "status": "completed"})),
        frame("event", json!({"id": "e-1", "type": "node.finished", "workflow_id": "wf-1"})),
    ]));
    let session = Session::create(SyncConfig::default(), seeded_snapshots(), push.clone());
    session.start().await;

    let view = until(&session, |v| v.connected && v.events.len() == 1).await;
    assert_eq!(view.connection_status, "Connected");
    assert_eq!(view.workflows.len(), 2);

    assert!(push.push(frame("metrics", json!({"active_workflows": 1}))));
    assert!(push.push(frame("workflow", json!({"id": "wf-9", "status": "running"}))));
    assert!(push.push(PushFrame::new(Some("event"), "not json")));
    assert!(push.push(frame("event", json!({"id": "e-2", "type": "node.started"}))));
    let view = until(&session, |v| v.events.len() == 2).await;

    assert_eq!(view.workflows[0].id, "wf-9");
    let wf1 = view.workflows.iter().find(|w| w.id == "wf-1").unwrap();
    assert_eq!(wf1.status, WorkflowStatus::Completed);
    assert_eq!(view.events[0].id, "e-2");
    let metrics = view.metrics.expect("metrics");
    assert_eq!(metrics.active_workflows, Some(1));
    assert!(metrics.extra.is_empty(), "metrics replaced wholesale");
    until(&session, |v| v.mode == FreshnessMode::Live).await;
    session.teardown();
}

#[tokio::test]
async fn server_error_message_sets_session_error_only() {
    let push = Arc::new(ScriptedPush::new().then_hold(Vec::new()));
    let session = Session::create(SyncConfig::default(), seeded_snapshots(), push.clone());
    session.start().await;
    until(&session, |v| v.connected).await;

    assert!(push.push(frame("error", json!({"message": "backend overloaded"}))));
    let view = until(&session, |v| v.error.is_some()).await;
    assert_eq!(view.error.as_deref(), Some("backend overloaded"));
    assert_eq!(view.workflows.len(), 2);
    assert_eq!(view.traces.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_discards_results_still_in_flight() {
    let snapshots = seeded_snapshots();
    snapshots.set_latency(Duration::from_millis(200));
    let session = Session::create(
        SyncConfig::default(),
        snapshots.clone(),
        Arc::new(ScriptedPush::new()),
    );

    assert_eq!(session.view().mode, FreshnessMode::Idle);

    let (report, ()) = tokio::join!(session.refresh_all(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.teardown();
    });
    assert!(report.discarded);
    assert!(report.applied.is_empty());

    let view = session.view();
    assert!(view.workflows.is_empty());
    assert!(view.metrics.is_none());
    assert!(!view.loading);
    assert_eq!(view.connection, ConnectionState::Disconnected);

    assert!(session.refresh_all().await.discarded);
    session.connect();
    assert_eq!(session.connection(), ConnectionState::Disconnected);
    session.teardown();
}

#[tokio::test(start_paused = true)]
async fn exhausted_reconnects_fall_back_to_polling() {
    let snapshots = seeded_snapshots();
    let session = Session::create(
        SyncConfig::default(),
        snapshots.clone(),
        Arc::new(ScriptedPush::new().then_fail("refused")),
    );
    session.start().await;
    assert_eq!(snapshots.calls(Resource::Metrics), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let view = session.view();
    assert!(matches!(view.connection, ConnectionState::Error(_)));
    assert!(view.connection_status.starts_with("Connection error"));
    assert_eq!(view.mode, FreshnessMode::Degraded);
    assert_eq!(snapshots.calls(Resource::Metrics), 2);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(snapshots.calls(Resource::Workflows), 3);
}
