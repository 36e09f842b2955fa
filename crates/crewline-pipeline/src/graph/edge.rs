use serde::{Deserialize, Serialize};

/// A directed `source -> target` link in the editor graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    /// Source node id.
    pub source: String,
    /// Target node id.
    pub target: String,
}

impl GraphEdge {
    /// Create an edge with the conventional `source->target` id.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: edge_id(&source, &target),
            source,
            target,
        }
    }

    /// Whether this edge touches the given node on either end.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

/// Stable id for the edge between two nodes.
pub fn edge_id(source: &str, target: &str) -> String {
    format!("{}->{}", source, target)
}
