use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crewline_core::types::{AgentDirectory, Stage};

use super::edge::GraphEdge;
use super::entry::find_entry_stages;
use super::node::GraphNode;

/// The editor's view of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

impl PipelineGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut GraphNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn has_edge(&self, source: &str, target: &str) -> bool {
        self.edges
            .iter()
            .any(|e| e.source == source && e.target == target)
    }

    /// Convert back into the persisted stage list.
    pub fn to_stages(&self) -> Vec<Stage> {
        graph_to_stages(&self.nodes, &self.edges)
    }
}

/// Build the editor graph for a stage list.
///
/// One node per stage and one edge per `next_stage_ids` entry. Nothing is
/// rejected: cyclic, disconnected or dangling input converts as-is.
pub fn stages_to_graph<A>(stages: &[Stage], agents: &A) -> PipelineGraph
where
    A: AgentDirectory + ?Sized,
{
    let entries: HashSet<String> = find_entry_stages(stages).into_iter().collect();

    let nodes = stages
        .iter()
        .map(|stage| {
            let mut node = GraphNode::from_stage(stage, agents);
            node.data.is_entry_point = entries.contains(&stage.id);
            node
        })
        .collect();

    let mut edges = Vec::new();
    for stage in stages {
        let mut seen = HashSet::new();
        for next in &stage.next_stage_ids {
            if seen.insert(next.as_str()) {
                edges.push(GraphEdge::new(stage.id.clone(), next.clone()));
            }
        }
    }

    PipelineGraph { nodes, edges }
}

/// Rebuild the stage list from the editor graph.
///
/// Each stage's fields come from its node data, except `id` (node id),
/// `position` (node position) and `next_stage_ids` (targets of the node's
/// outgoing edges, in edge order). Edges whose ends no longer exist are
/// dropped.
pub fn graph_to_stages(nodes: &[GraphNode], edges: &[GraphEdge]) -> Vec<Stage> {
    let node_ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();

    let dropped = edges
        .iter()
        .filter(|e| !node_ids.contains(e.source.as_str()) || !node_ids.contains(e.target.as_str()))
        .count();
    if dropped > 0 {
        debug!(dropped, "Dropped edges pointing at removed stages");
    }

    nodes
        .iter()
        .map(|node| {
            let mut stage = node.data.stage.clone();
            stage.id = node.id.clone();
            stage.position = node.position;

            let mut seen = HashSet::new();
            stage.next_stage_ids = edges
                .iter()
                .filter(|e| e.source == node.id && node_ids.contains(e.target.as_str()))
                .filter(|e| seen.insert(e.target.as_str()))
                .map(|e| e.target.clone())
                .collect();
            stage
        })
        .collect()
}
