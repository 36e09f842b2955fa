//! Pipeline graph model: the stage list a team persists, and the node/edge
//! graph the visual editor works on.
//!
//! Stages carry their successors in `next_stage_ids`; the editor graph carries
//! them as explicit `{source, target}` edges. `convert` maps between the two,
//! `validate` checks that a stage list is a sound workflow (no cycles, no
//! dangling references, at least one entry), and `layout` assigns layered
//! coordinates for display. Everything here is a pure function over a
//! snapshot, so it can run on half-edited, invalid graphs.

pub mod convert;
pub mod edge;
pub mod entry;
pub mod layout;
pub mod node;
pub mod validate;

pub use convert::{graph_to_stages, stages_to_graph, PipelineGraph};
pub use edge::GraphEdge;
pub use entry::{find_entry_stages, find_exit_stages};
pub use layout::{auto_layout_graph, compute_ranks, LayoutOptions};
pub use node::{GraphNode, StageNodeData};
pub use validate::{
    refresh_configuration, validate_pipeline_graph, ValidationIssue, ValidationReport,
};
