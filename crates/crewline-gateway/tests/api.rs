use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use std::time::Duration;

use crewline_core::config::{AppConfig, EditorConfig, GatewayConfig};
use crewline_core::event::{EventBus, PipelineEvent};
use crewline_gateway::{build_router, AppState};
use crewline_pipeline::SqlitePipelineStore;
use crewline_test_utils::{agent_directory, cyclic_pipeline, fan_out_pipeline, stages_json};

fn state_with(config: &AppConfig, store: SqlitePipelineStore) -> (Arc<AppState>, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let state = AppState::new(config, Arc::new(store), bus.clone(), Arc::new(agent_directory()));
    (Arc::new(state), bus)
}

fn app_with(token: Option<&str>) -> (Router, Arc<EventBus>) {
    let mut config = AppConfig::default();
    config.gateway = Some(GatewayConfig {
        token: token.map(str::to_string),
        ..GatewayConfig::default()
    });
    let bus = Arc::new(EventBus::default());
    let store = Arc::new(SqlitePipelineStore::in_memory().unwrap());
    let state = AppState::new(&config, store, bus.clone(), Arc::new(agent_directory()));
    (build_router(Arc::new(state)), bus)
}

fn app() -> Router {
    app_with(None).0
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(b) => builder.body(Body::from(b.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Save the fan-out pipeline for `team-a`, activate it and return its id.
async fn activate_fan_out(app: &Router) -> String {
    let (status, saved) = send(
        app,
        "PUT",
        "/api/teams/team-a/pipelines",
        Some(json!({"name": "Delivery", "stages": stages_json(&fan_out_pipeline())})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = saved["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        app,
        "POST",
        &format!("/api/teams/team-a/pipelines/{}/activate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    id
}

#[tokio::test]
async fn health_needs_no_auth() {
    let (app, _) = app_with(Some("secret"));
    let (status, body) = send(&app, "GET", "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn token_is_enforced() {
    let (app, _) = app_with(Some("secret"));
    let payload = stages_json(&fan_out_pipeline());

    let (status, _) = send(&app, "POST", "/api/pipelines/validate", Some(payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("POST")
        .uri("/api/pipelines/validate")
        .header("content-type", "application/json")
        .header("authorization", "Bearer secret")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (status, _) = send(&app, "POST", "/api/pipelines/validate?token=secret", Some(payload)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn validate_reports_cycles() {
    let app = app();
    let (status, report) = send(
        &app,
        "POST",
        "/api/pipelines/validate",
        Some(stages_json(&cyclic_pipeline())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["isValid"], false);
    assert_eq!(report["errors"][0]["kind"], "cycle");
    assert_eq!(report["entryStageIds"], json!(["start"]));
}

#[tokio::test]
async fn graph_roundtrip_and_layout() {
    let app = app();
    let (status, graph) = send(
        &app,
        "POST",
        "/api/pipelines/graph",
        Some(stages_json(&fan_out_pipeline())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 4);
    assert_eq!(graph["edges"].as_array().unwrap().len(), 3);
    assert_eq!(graph["nodes"][0]["data"]["agents"][0]["id"], "planner");
    assert_eq!(graph["nodes"][0]["data"]["isEntryPoint"], true);

    let (status, laid_out) = send(&app, "POST", "/api/pipelines/layout", Some(graph.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(laid_out["nodes"][1]["position"]["y"], 150.0);

    let (status, stages) = send(&app, "POST", "/api/pipelines/stages", Some(laid_out)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stages[1]["nextStageIds"], json!(["s3", "s4"]));
}

#[tokio::test]
async fn invalid_pipeline_cannot_be_activated() {
    let (app, bus) = app_with(None);
    let mut rx = bus.subscribe();

    let (status, saved) = send(
        &app,
        "PUT",
        "/api/teams/team-a/pipelines",
        Some(stages_json(&cyclic_pipeline())),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["isValid"], false);
    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::PipelineSynced { is_valid: false, .. }
    ));

    let id = saved["id"].as_str().unwrap();
    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/teams/team-a/pipelines/{}/activate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("cannot be activated"));

    let (status, _) = send(&app, "GET", "/api/teams/team-a/pipeline", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mission_execution_flow() {
    let (app, bus) = app_with(None);
    let pipeline_id = activate_fan_out(&app).await;

    let (status, active) = send(&app, "GET", "/api/teams/team-a/pipeline", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["id"], pipeline_id.as_str());

    let (status, execution) = send(
        &app,
        "POST",
        "/api/missions/m-1/execution",
        Some(json!({"teamId": "team-a"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["pipelineId"], pipeline_id.as_str());
    assert_eq!(execution["stages"][0]["status"], "active");

    let mut rx = bus.subscribe();
    let complete = json!({
        "eventId": "evt-1",
        "event": {"type": "complete_stage", "stageId": "s1", "commits": ["abc"], "cost": 1.25}
    });
    let (status, body) = send(&app, "POST", "/api/missions/m-1/events", Some(complete.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "applied");
    assert_eq!(body["execution"]["totalCost"], 1.25);
    assert_eq!(body["readyStageIds"], json!(["s2"]));
    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::StageTransitioned { .. }
    ));

    // Redelivery changes nothing
    let (status, body) = send(&app, "POST", "/api/missions/m-1/events", Some(complete)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "no_op");
    assert_eq!(body["execution"]["totalCost"], 1.25);

    let (status, execution) = send(&app, "GET", "/api/missions/m-1/execution", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["stages"][0]["commits"], json!(["abc"]));

    // Creating again returns the same run
    let (_, again) = send(
        &app,
        "POST",
        "/api/missions/m-1/execution",
        Some(json!({"teamId": "team-a"})),
    )
    .await;
    assert_eq!(again["totalCost"], 1.25);
}

#[tokio::test]
async fn event_errors_map_to_status_codes() {
    let app = app();
    activate_fan_out(&app).await;
    send(
        &app,
        "POST",
        "/api/missions/m-2/execution",
        Some(json!({"teamId": "team-a"})),
    )
    .await;

    let early = json!({"event": {"type": "start_stage", "stageId": "s3"}});
    let (status, body) = send(&app, "POST", "/api/missions/m-2/events", Some(early)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("waiting on predecessors"));

    let unknown = json!({"event": {"type": "start_stage", "stageId": "nope"}});
    let (status, _) = send(&app, "POST", "/api/missions/m-2/events", Some(unknown)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let no_mission = json!({"event": {"type": "start_stage", "stageId": "s1"}});
    let (status, _) = send(&app, "POST", "/api/missions/ghost/events", Some(no_mission)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        "POST",
        "/api/missions/m-3/execution",
        Some(json!({"teamId": "team-without-pipeline"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn active_pipeline_rejects_invalid_resave() {
    let app = app();
    let id = activate_fan_out(&app).await;

    let (status, body) = send(
        &app,
        "PUT",
        "/api/teams/team-a/pipelines",
        Some(json!({"id": id, "name": "Delivery", "stages": stages_json(&cyclic_pipeline())})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("is invalid"));

    let (status, active) = send(&app, "GET", "/api/teams/team-a/pipeline", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(active["isValid"], true);
    assert_eq!(active["stages"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn pipelines_stay_with_their_team() {
    let app = app();
    let id = activate_fan_out(&app).await;

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/teams/team-b/pipelines/{}/activate", id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/teams/team-b/pipelines",
        Some(json!({"id": id, "name": "Stolen", "stages": stages_json(&fan_out_pipeline())})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, listed) = send(&app, "GET", "/api/teams/team-b/pipelines", None).await;
    assert_eq!(listed, json!([]));
    let (_, listed) = send(&app, "GET", "/api/teams/team-a/pipelines", None).await;
    assert_eq!(listed[0]["name"], "Delivery");
}

#[tokio::test]
async fn failed_save_leaves_event_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("crewline.db");
    let store = SqlitePipelineStore::open(&path).unwrap();
    let (state, bus) = state_with(&AppConfig::default(), store);
    let app = build_router(state);

    activate_fan_out(&app).await;
    send(
        &app,
        "POST",
        "/api/missions/m-1/execution",
        Some(json!({"teamId": "team-a"})),
    )
    .await;

    // Make every execution write fail from a second connection
    let side = rusqlite::Connection::open(&path).unwrap();
    side.execute_batch(
        "CREATE TRIGGER reject_insert BEFORE INSERT ON executions
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;
         CREATE TRIGGER reject_update BEFORE UPDATE ON executions
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    let mut rx = bus.subscribe();
    let complete = json!({
        "eventId": "evt-1",
        "event": {"type": "complete_stage", "stageId": "s1", "cost": 1.0}
    });
    let (status, _) = send(&app, "POST", "/api/missions/m-1/events", Some(complete.clone())).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(rx.try_recv().is_err());

    let (_, execution) = send(&app, "GET", "/api/missions/m-1/execution", None).await;
    assert_eq!(execution["stages"][0]["status"], "active");
    assert_eq!(execution["totalCost"], 0.0);

    side.execute_batch("DROP TRIGGER reject_insert; DROP TRIGGER reject_update;")
        .unwrap();

    let (status, body) = send(&app, "POST", "/api/missions/m-1/events", Some(complete)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["outcome"], "applied");
    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::StageTransitioned { .. }
    ));
}

#[tokio::test]
async fn finished_missions_leave_memory() {
    let (state, _) = state_with(&AppConfig::default(), SqlitePipelineStore::in_memory().unwrap());
    let app = build_router(state.clone());
    activate_fan_out(&app).await;
    send(
        &app,
        "POST",
        "/api/missions/m-1/execution",
        Some(json!({"teamId": "team-a"})),
    )
    .await;

    let mut last = Value::Null;
    for (n, stage) in ["s1", "s2", "s3", "s4"].iter().enumerate() {
        let event = json!({
            "eventId": format!("evt-{}", n),
            "event": {"type": "complete_stage", "stageId": stage, "cost": 0.5}
        });
        let (status, body) = send(&app, "POST", "/api/missions/m-1/events", Some(event)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        last = body;
    }
    assert_eq!(last["finished"], true);
    assert!(!state.missions.lock().await.contains_key("m-1"));

    // Still served from the store, and redelivery is still recognised
    let (status, execution) = send(&app, "GET", "/api/missions/m-1/execution", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["totalCost"], 2.0);

    let replay = json!({
        "eventId": "evt-3",
        "event": {"type": "complete_stage", "stageId": "s4", "cost": 0.5}
    });
    let (_, body) = send(&app, "POST", "/api/missions/m-1/events", Some(replay)).await;
    assert_eq!(body["result"]["outcome"], "no_op");
    assert_eq!(body["execution"]["totalCost"], 2.0);
    assert!(!state.missions.lock().await.contains_key("m-1"));
}

#[tokio::test]
async fn editor_edits_flush_after_configured_debounce() {
    let mut config = AppConfig::default();
    config.editor = EditorConfig { debounce_ms: 20 };
    let (state, bus) = state_with(&config, SqlitePipelineStore::in_memory().unwrap());
    let app = build_router(state.clone());
    let id = activate_fan_out(&app).await;
    let mut rx = bus.subscribe();

    let edits = json!([
        {"op": "move_stage", "stageId": "s4", "position": {"x": 300, "y": 10}},
        {"op": "connect", "source": "ghost", "target": "s1"},
        {"op": "auto_layout"}
    ]);
    let uri = format!("/api/teams/team-a/pipelines/{}/edits", id);
    let (status, body) = send(&app, "POST", &uri, Some(edits)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["applied"], 2);
    assert_eq!(body["dirty"], true);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::PipelineSynced { is_valid: true, .. }
    ));
    let (_, active) = send(&app, "GET", "/api/teams/team-a/pipeline", None).await;
    assert_eq!(active["stages"][1]["position"]["y"], 150.0);

    // A cycle drawn on the active pipeline is not written through
    let cycle = json!([{"op": "connect", "source": "s3", "target": "s1"}]);
    send(&app, "POST", &uri, Some(cycle)).await;
    let flush = format!("/api/teams/team-a/pipelines/{}/flush", id);
    let (status, _) = send(&app, "POST", &flush, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, active) = send(&app, "GET", "/api/teams/team-a/pipeline", None).await;
    assert_eq!(active["isValid"], true);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/teams/team-b/pipelines/{}/edits", id),
        Some(json!([])),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state.shutdown.cancel();
}
