use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crewline_core::config::EditorConfig;
use crewline_core::error::Result;
use crewline_core::event::{EventBus, PipelineEvent};
use crewline_core::types::{AgentDirectory, PipelineConfiguration, Position, Stage};

use crate::graph::{
    auto_layout_graph, refresh_configuration, stages_to_graph, GraphEdge, GraphNode,
    LayoutOptions, PipelineGraph, ValidationReport,
};
use crate::store::SqlitePipelineStore;

/// One user edit of the visual graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum GraphDelta {
    /// Add a node; its `next_stage_ids` become edges.
    AddStage { stage: Stage },
    /// Remove a node together with every edge touching it.
    RemoveStage { stage_id: String },
    MoveStage { stage_id: String, position: Position },
    Connect { source: String, target: String },
    Disconnect { source: String, target: String },
    /// Replace a node's stage data. Position and edges stay with the graph.
    UpdateStage { stage: Stage },
    /// Re-run auto layout over the current graph.
    AutoLayout,
}

/// Result of a flush.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub configuration: PipelineConfiguration,
    pub report: ValidationReport,
}

struct EditorState {
    configuration: PipelineConfiguration,
    graph: PipelineGraph,
}

/// Single-writer editing session over one pipeline configuration.
///
/// Edits mutate the in-memory graph and set a dirty flag. The graph is
/// converted back to stages, validated and persisted only on [`flush`],
/// which [`run`] calls once per quiet period so a burst of drags costs a
/// single validation.
///
/// [`flush`]: EditorSession::flush
/// [`run`]: EditorSession::run
pub struct EditorSession {
    state: Mutex<EditorState>,
    dirty: AtomicBool,
    notify: Notify,
    debounce: Duration,
    agents: Arc<dyn AgentDirectory>,
    layout: LayoutOptions,
    event_bus: Arc<EventBus>,
    store: Option<(Arc<SqlitePipelineStore>, String)>,
}

impl EditorSession {
    pub fn new(
        configuration: PipelineConfiguration,
        agents: Arc<dyn AgentDirectory>,
        event_bus: Arc<EventBus>,
        options: &EditorConfig,
    ) -> Self {
        let graph = stages_to_graph(&configuration.stages, agents.as_ref());
        Self {
            state: Mutex::new(EditorState {
                configuration,
                graph,
            }),
            dirty: AtomicBool::new(false),
            notify: Notify::new(),
            debounce: Duration::from_millis(options.debounce_ms),
            agents,
            layout: LayoutOptions::default(),
            event_bus,
            store: None,
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_layout(mut self, layout: LayoutOptions) -> Self {
        self.layout = layout;
        self
    }

    /// Persist every flushed configuration under `team_id`.
    pub fn with_store(mut self, store: Arc<SqlitePipelineStore>, team_id: impl Into<String>) -> Self {
        self.store = Some((store, team_id.into()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn graph(&self) -> PipelineGraph {
        self.lock().graph.clone()
    }

    /// The configuration as of the last flush.
    pub fn configuration(&self) -> PipelineConfiguration {
        self.lock().configuration.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Apply an edit. Returns false when the edit changed nothing
    /// (unknown stage, existing edge, ...).
    pub fn apply(&self, delta: GraphDelta) -> bool {
        let changed = {
            let mut state = self.lock();
            apply_delta(&mut state.graph, delta, self.agents.as_ref(), &self.layout)
        };
        if changed {
            self.mark_dirty();
        }
        changed
    }

    /// Replace the graph with an externally changed stage list, laid out afresh.
    pub fn load_stages(&self, stages: &[Stage]) {
        {
            let mut state = self.lock();
            let mut graph = stages_to_graph(stages, self.agents.as_ref());
            graph.nodes = auto_layout_graph(&graph.nodes, &graph.edges, &self.layout);
            state.graph = graph;
        }
        debug!(stages = stages.len(), "Editor graph reloaded");
        self.mark_dirty();
    }

    /// Take over a configuration saved outside this session. Unflushed
    /// edits are dropped; node positions come from the stages.
    pub fn reset(&self, configuration: PipelineConfiguration) {
        let mut state = self.lock();
        state.graph = stages_to_graph(&configuration.stages, self.agents.as_ref());
        state.configuration = configuration;
        self.dirty.store(false, Ordering::Release);
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Write pending edits back into the configuration.
    ///
    /// Returns `None` when nothing changed since the last flush. A failed
    /// persist leaves the session dirty so the next flush retries.
    pub fn flush(&self) -> Result<Option<SyncOutcome>> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(None);
        }

        let (configuration, report) = {
            let mut state = self.lock();
            let stages = state.graph.to_stages();
            state.configuration.stages = stages;
            let report = refresh_configuration(&mut state.configuration);
            // Rebuild so entry/exit flags and healed edges match the stages
            state.graph = stages_to_graph(&state.configuration.stages, self.agents.as_ref());
            (state.configuration.clone(), report)
        };

        if let Some((store, team_id)) = &self.store {
            if let Err(e) = store.save_configuration(team_id, &configuration) {
                self.dirty.store(true, Ordering::Release);
                return Err(e);
            }
        }

        info!(
            pipeline_id = %configuration.id,
            stages = configuration.stages.len(),
            is_valid = report.is_valid,
            errors = report.errors.len(),
            "Pipeline synced"
        );
        self.event_bus.publish(PipelineEvent::PipelineSynced {
            pipeline_id: configuration.id.clone(),
            is_valid: report.is_valid,
            error_count: report.errors.len(),
        });

        Ok(Some(SyncOutcome {
            configuration,
            report,
        }))
    }

    /// Debounce loop: after each edit, wait for the quiet period then flush.
    /// Pending edits are flushed once more on cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        debug!(debounce_ms = self.debounce.as_millis() as u64, "Editor session started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => break,
            }
            tokio::select! {
                _ = tokio::time::sleep(self.debounce) => {}
                _ = cancel.cancelled() => break,
            }
            if let Err(e) = self.flush() {
                error!(error = %e, "Editor flush failed");
            }
        }

        if let Err(e) = self.flush() {
            error!(error = %e, "Final editor flush failed");
        }
        debug!("Editor session stopped");
    }
}

fn apply_delta<A>(
    graph: &mut PipelineGraph,
    delta: GraphDelta,
    agents: &A,
    layout: &LayoutOptions,
) -> bool
where
    A: AgentDirectory + ?Sized,
{
    match delta {
        GraphDelta::AddStage { stage } => {
            if graph.node(&stage.id).is_some() {
                debug!(stage_id = %stage.id, "Stage already exists");
                return false;
            }
            for next in &stage.next_stage_ids {
                if !graph.has_edge(&stage.id, next) {
                    graph.edges.push(GraphEdge::new(stage.id.clone(), next.clone()));
                }
            }
            graph.nodes.push(GraphNode::from_stage(&stage, agents));
            true
        }
        GraphDelta::RemoveStage { stage_id } => {
            let before = graph.nodes.len();
            graph.nodes.retain(|n| n.id != stage_id);
            if graph.nodes.len() == before {
                return false;
            }
            graph.edges.retain(|e| !e.touches(&stage_id));
            true
        }
        GraphDelta::MoveStage { stage_id, position } => match graph.node_mut(&stage_id) {
            Some(node) if node.position != position => {
                node.position = position;
                node.data.stage.position = position;
                true
            }
            _ => false,
        },
        GraphDelta::Connect { source, target } => {
            if graph.node(&source).is_none() || graph.node(&target).is_none() {
                debug!(%source, %target, "Connect ignored, endpoint missing");
                return false;
            }
            if graph.has_edge(&source, &target) {
                return false;
            }
            graph.edges.push(GraphEdge::new(source, target));
            true
        }
        GraphDelta::Disconnect { source, target } => {
            let before = graph.edges.len();
            graph
                .edges
                .retain(|e| !(e.source == source && e.target == target));
            graph.edges.len() != before
        }
        GraphDelta::UpdateStage { stage } => {
            let Some(node) = graph.node_mut(&stage.id) else {
                return false;
            };
            let updated = GraphNode::from_stage(&stage, agents);
            node.data.stage = Stage {
                position: node.position,
                next_stage_ids: node.data.stage.next_stage_ids.clone(),
                ..updated.data.stage
            };
            node.data.agents = updated.data.agents;
            true
        }
        GraphDelta::AutoLayout => {
            let nodes = auto_layout_graph(&graph.nodes, &graph.edges, layout);
            let moved = nodes
                .iter()
                .zip(&graph.nodes)
                .any(|(after, before)| after.position != before.position);
            graph.nodes = nodes;
            moved
        }
    }
}
