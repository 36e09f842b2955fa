use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::debug;

use crewline_core::config::LayoutConfig;
use crewline_core::types::Position;

use super::edge::GraphEdge;
use super::node::GraphNode;

/// Spacing used by [`auto_layout_graph`].
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutOptions {
    pub row_height: f64,
    pub column_width: f64,
    pub origin_x: f64,
    pub origin_y: f64,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self::from(&LayoutConfig::default())
    }
}

impl From<&LayoutConfig> for LayoutOptions {
    fn from(config: &LayoutConfig) -> Self {
        Self {
            row_height: config.row_height,
            column_width: config.column_width,
            origin_x: config.origin_x,
            origin_y: config.origin_y,
        }
    }
}

/// Node indices plus edges resolved to those indices.
struct IndexedGraph {
    successors: Vec<Vec<usize>>,
    predecessors: Vec<Vec<usize>>,
}

impl IndexedGraph {
    fn build(nodes: &[GraphNode], edges: &[GraphEdge]) -> Self {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            index.entry(node.id.as_str()).or_insert(i);
        }

        let mut successors = vec![Vec::new(); nodes.len()];
        let mut predecessors = vec![Vec::new(); nodes.len()];
        for edge in edges {
            let (Some(&s), Some(&t)) = (index.get(edge.source.as_str()), index.get(edge.target.as_str()))
            else {
                continue;
            };
            if !successors[s].contains(&t) {
                successors[s].push(t);
                predecessors[t].push(s);
            }
        }

        Self {
            successors,
            predecessors,
        }
    }
}

/// Longest-path rank of every node, by node position.
///
/// Kahn's topological order over the graph; a node's rank is one past the
/// largest rank among its predecessors. Nodes that never reach in-degree zero
/// (on or behind a cycle) get fallback ranks past the largest rank seen so
/// far, one row each, so the pass always terminates.
fn rank_nodes(graph: &IndexedGraph) -> Vec<usize> {
    let n = graph.successors.len();
    let mut in_degree: Vec<usize> = graph.predecessors.iter().map(Vec::len).collect();
    let mut rank: Vec<Option<usize>> = vec![None; n];
    let mut longest: Vec<usize> = vec![0; n];
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();

    while let Some(u) = queue.pop_front() {
        rank[u] = Some(longest[u]);
        for &v in &graph.successors[u] {
            longest[v] = longest[v].max(longest[u] + 1);
            in_degree[v] = in_degree[v].saturating_sub(1);
            if in_degree[v] == 0 {
                queue.push_back(v);
            }
        }
    }

    let mut max_rank = rank.iter().flatten().copied().max();
    let mut fallback = 0usize;
    let ranks = rank
        .into_iter()
        .map(|r| {
            r.unwrap_or_else(|| {
                fallback += 1;
                let next = max_rank.map_or(0, |m| m + 1);
                max_rank = Some(next);
                next
            })
        })
        .collect();

    if fallback > 0 {
        debug!(nodes = fallback, "Layout assigned fallback ranks to cyclic nodes");
    }
    ranks
}

/// Rank of every node keyed by node id.
pub fn compute_ranks(nodes: &[GraphNode], edges: &[GraphEdge]) -> HashMap<String, usize> {
    let graph = IndexedGraph::build(nodes, edges);
    let ranks = rank_nodes(&graph);

    let mut by_id = HashMap::with_capacity(nodes.len());
    for (node, rank) in nodes.iter().zip(ranks) {
        by_id.entry(node.id.clone()).or_insert(rank);
    }
    by_id
}

/// Assign layered coordinates to every node.
///
/// Nodes sharing a rank form one row at `y = origin_y + rank * row_height`,
/// spaced `column_width` apart and centered on `origin_x`. Rows after the
/// first are ordered by the mean `x` of each node's already-placed parents to
/// keep children under their parents. Never fails: cyclic or dangling input
/// still yields a position for every node.
pub fn auto_layout_graph(
    nodes: &[GraphNode],
    edges: &[GraphEdge],
    options: &LayoutOptions,
) -> Vec<GraphNode> {
    let graph = IndexedGraph::build(nodes, edges);
    let ranks = rank_nodes(&graph);

    let mut rows: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &rank) in ranks.iter().enumerate() {
        rows.entry(rank).or_default().push(i);
    }

    let mut x_of: Vec<Option<f64>> = vec![None; nodes.len()];
    let mut positions: Vec<Position> = vec![Position::default(); nodes.len()];

    for (&rank, members) in &rows {
        let mut ordered: Vec<(f64, usize)> = members
            .iter()
            .map(|&i| {
                let parent_xs: Vec<f64> = graph.predecessors[i]
                    .iter()
                    .filter_map(|&p| x_of[p])
                    .collect();
                let barycenter = if parent_xs.is_empty() {
                    f64::INFINITY
                } else {
                    parent_xs.iter().sum::<f64>() / parent_xs.len() as f64
                };
                (barycenter, i)
            })
            .collect();
        ordered.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let center = (ordered.len() as f64 - 1.0) / 2.0;
        let y = options.origin_y + rank as f64 * options.row_height;
        for (slot, &(_, i)) in ordered.iter().enumerate() {
            let x = options.origin_x + (slot as f64 - center) * options.column_width;
            x_of[i] = Some(x);
            positions[i] = Position::new(x, y);
        }
    }

    nodes
        .iter()
        .zip(positions)
        .map(|(node, position)| {
            let mut node = node.clone();
            node.position = position;
            node.data.stage.position = position;
            node
        })
        .collect()
}
