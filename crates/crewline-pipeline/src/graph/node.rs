use serde::{Deserialize, Serialize};

use crewline_core::types::{AgentDirectory, AgentProfile, Position, Stage};

/// Data the editor attaches to each node.
///
/// `stage` is the source of every stage field except `id`, `position` and
/// `next_stage_ids`, which the graph itself owns (node id, node position and
/// outgoing edges respectively).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageNodeData {
    pub stage: Stage,
    /// Resolved profiles of `stage.assigned_agent_ids`; unknown ids are omitted.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,
    /// No incoming edge.
    #[serde(default)]
    pub is_entry_point: bool,
    /// No outgoing edge.
    #[serde(default)]
    pub is_exit_point: bool,
}

/// A node in the editor graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub position: Position,
    pub data: StageNodeData,
}

impl GraphNode {
    /// Build a node for a stage, resolving its agents through the directory.
    pub fn from_stage<A>(stage: &Stage, agents: &A) -> Self
    where
        A: AgentDirectory + ?Sized,
    {
        Self {
            id: stage.id.clone(),
            position: stage.position,
            data: StageNodeData {
                stage: stage.clone(),
                agents: resolve_agents(&stage.assigned_agent_ids, agents),
                is_entry_point: false,
                is_exit_point: stage.is_exit(),
            },
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }
}

/// Look up each agent id, skipping the ones the directory does not know.
pub fn resolve_agents<A>(agent_ids: &[String], agents: &A) -> Vec<AgentProfile>
where
    A: AgentDirectory + ?Sized,
{
    agent_ids
        .iter()
        .filter_map(|id| {
            let profile = agents.resolve(id);
            if profile.is_none() {
                tracing::debug!(agent_id = %id, "Agent not found in directory");
            }
            profile
        })
        .collect()
}
