use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crewline_core::error::CrewlineError;
use crewline_core::event::PipelineEvent;
use crewline_core::execution::PipelineExecution;
use crewline_core::types::{PipelineConfiguration, PipelineDocument, Stage};
use crewline_pipeline::{
    auto_layout_graph, graph_to_stages, refresh_configuration, stages_to_graph,
    validate_pipeline_graph, EditorSession, EventEnvelope, ExecutionStateMachine, GraphDelta,
    PipelineGraph, ValidationReport,
};

use crate::error::ApiError;
use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

// GET /api/health, no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Stateless graph operations ──────────────────────────────────

// POST /api/pipelines/validate
pub async fn validate(
    _auth: Authenticated,
    Json(doc): Json<PipelineDocument>,
) -> Json<ValidationReport> {
    let config = doc.into_configuration("adhoc");
    Json(validate_pipeline_graph(&config.stages))
}

// POST /api/pipelines/graph
pub async fn to_graph(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(doc): Json<PipelineDocument>,
) -> Json<PipelineGraph> {
    let config = doc.into_configuration("adhoc");
    Json(stages_to_graph(&config.stages, state.agents.as_ref()))
}

// POST /api/pipelines/stages
pub async fn to_stages(_auth: Authenticated, Json(graph): Json<PipelineGraph>) -> Json<Vec<Stage>> {
    Json(graph_to_stages(&graph.nodes, &graph.edges))
}

// POST /api/pipelines/layout
pub async fn layout(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Json(graph): Json<PipelineGraph>,
) -> Json<PipelineGraph> {
    let nodes = auto_layout_graph(&graph.nodes, &graph.edges, &state.layout);
    Json(PipelineGraph {
        nodes,
        edges: graph.edges,
    })
}

// ── Team pipelines ──────────────────────────────────────────────

// PUT /api/teams/{team}/pipelines
pub async fn save_pipeline(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
    Json(doc): Json<PipelineDocument>,
) -> ApiResult<PipelineConfiguration> {
    let mut config = doc.into_configuration("Pipeline");
    let report = refresh_configuration(&mut config);
    state.store.save_configuration(&team, &config)?;
    if let Some(session) = state.editors.lock().await.get(&config.id) {
        session.reset(config.clone());
    }

    state.event_bus.publish(PipelineEvent::PipelineSynced {
        pipeline_id: config.id.clone(),
        is_valid: report.is_valid,
        error_count: report.errors.len(),
    });
    Ok(Json(config))
}

// GET /api/teams/{team}/pipelines
pub async fn list_pipelines(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> ApiResult<Vec<PipelineConfiguration>> {
    Ok(Json(state.store.list_configurations(&team)?))
}

// POST /api/teams/{team}/pipelines/{id}/activate
pub async fn activate_pipeline(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((team, id)): Path<(String, String)>,
) -> ApiResult<PipelineConfiguration> {
    let config = state.store.activate(&team, &id)?;
    state.event_bus.publish(PipelineEvent::PipelineActivated {
        team_id: team,
        pipeline_id: config.id.clone(),
    });
    Ok(Json(config))
}

// GET /api/teams/{team}/pipeline
pub async fn active_pipeline(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(team): Path<String>,
) -> ApiResult<PipelineConfiguration> {
    state
        .store
        .active_pipeline(&team)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No active pipeline for team {}", team)))
}

// ── Editor sessions ─────────────────────────────────────────────

// POST /api/teams/{team}/pipelines/{id}/edits
//
// Edits are flushed to the store once the editor's debounce period passes
// without further edits.
pub async fn edit_pipeline(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((team, id)): Path<(String, String)>,
    Json(deltas): Json<Vec<GraphDelta>>,
) -> ApiResult<serde_json::Value> {
    let session = editor_session(&state, &team, &id).await?;
    let applied = deltas
        .into_iter()
        .map(|delta| session.apply(delta))
        .filter(|changed| *changed)
        .count();

    Ok(Json(serde_json::json!({
        "applied": applied,
        "dirty": session.is_dirty(),
        "graph": session.graph(),
    })))
}

// POST /api/teams/{team}/pipelines/{id}/flush
pub async fn flush_pipeline(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path((team, id)): Path<(String, String)>,
) -> ApiResult<PipelineConfiguration> {
    let session = editor_session(&state, &team, &id).await?;
    session.flush()?;
    Ok(Json(session.configuration()))
}

/// The open session of a team's pipeline, started on first use.
async fn editor_session(
    state: &Arc<AppState>,
    team: &str,
    id: &str,
) -> Result<Arc<EditorSession>, ApiError> {
    let config = state
        .store
        .load_team_configuration(team, id)?
        .ok_or_else(|| CrewlineError::PipelineNotFound(id.to_string()))?;

    let mut editors = state.editors.lock().await;
    if let Some(session) = editors.get(id) {
        return Ok(session.clone());
    }

    let session = Arc::new(
        EditorSession::new(config, state.agents.clone(), state.event_bus.clone(), &state.editor)
            .with_layout(state.layout.clone())
            .with_store(state.store.clone(), team),
    );
    tokio::spawn(session.clone().run(state.shutdown.child_token()));
    info!(team_id = %team, pipeline_id = %id, "Editor session opened");

    editors.insert(id.to_string(), session.clone());
    Ok(session)
}

// ── Mission executions ──────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExecutionBody {
    pub team_id: String,
}

// POST /api/missions/{mission}/execution
//
// Idempotent: an existing execution for the mission is returned unchanged.
pub async fn create_execution(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(mission): Path<String>,
    Json(body): Json<CreateExecutionBody>,
) -> ApiResult<PipelineExecution> {
    let mut missions = state.missions.lock().await;
    if let Some(machine) = missions.get(&mission) {
        return Ok(Json(machine.execution().clone()));
    }
    if let Some(existing) = state.store.load_execution(&mission)? {
        return Ok(Json(existing));
    }

    let config = state.store.active_pipeline(&body.team_id)?.ok_or_else(|| {
        ApiError::not_found(format!("No active pipeline for team {}", body.team_id))
    })?;
    let machine = ExecutionStateMachine::new(&config, mission.clone(), &state.execution);
    state.store.save_execution(machine.execution())?;

    info!(mission_id = %mission, pipeline_id = %config.id, "Mission execution created");
    let execution = machine.execution().clone();
    missions.insert(mission, machine);
    Ok(Json(execution))
}

// GET /api/missions/{mission}/execution
pub async fn get_execution(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(mission): Path<String>,
) -> ApiResult<PipelineExecution> {
    if let Some(machine) = state.missions.lock().await.get(&mission) {
        return Ok(Json(machine.execution().clone()));
    }
    state
        .store
        .load_execution(&mission)?
        .map(Json)
        .ok_or_else(|| CrewlineError::ExecutionNotFound(mission).into())
}

// POST /api/missions/{mission}/events
pub async fn apply_event(
    _auth: Authenticated,
    State(state): State<Arc<AppState>>,
    Path(mission): Path<String>,
    Json(envelope): Json<EventEnvelope>,
) -> ApiResult<serde_json::Value> {
    let mut missions = state.missions.lock().await;
    // Applied to a copy; the live machine only changes once the save succeeds
    let mut machine = match missions.get(&mission) {
        Some(machine) => machine.clone(),
        None => resume_machine(&state, &mission)?,
    };

    let outcome = machine.apply(envelope)?;
    if !outcome.is_no_op() {
        state.store.save_execution(machine.execution())?;
    }

    for t in outcome.transitions() {
        state.event_bus.publish(PipelineEvent::StageTransitioned {
            mission_id: mission.clone(),
            stage_id: t.stage_id.clone(),
            from: t.from,
            to: t.to,
        });
    }

    let body = serde_json::json!({
        "result": outcome,
        "execution": machine.execution(),
        "readyStageIds": machine.ready_stages(),
        "finished": machine.is_finished(),
    });

    if machine.is_finished() {
        if missions.remove(&mission).is_some() {
            info!(mission_id = %mission, "Mission finished");
        }
    } else {
        missions.insert(mission, machine);
    }
    Ok(Json(body))
}

fn resume_machine(state: &AppState, mission: &str) -> Result<ExecutionStateMachine, ApiError> {
    let execution = state
        .store
        .load_execution(mission)?
        .ok_or_else(|| CrewlineError::ExecutionNotFound(mission.to_string()))?;
    let config = state
        .store
        .load_configuration(&execution.pipeline_id)?
        .ok_or_else(|| CrewlineError::PipelineNotFound(execution.pipeline_id.clone()))?;
    Ok(ExecutionStateMachine::resume(&config, execution, &state.execution))
}
