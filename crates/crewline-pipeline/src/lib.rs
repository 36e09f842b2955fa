pub mod editor;
pub mod execution;
pub mod graph;
pub mod store;

pub use editor::{EditorSession, GraphDelta, SyncOutcome};
pub use execution::{
    EventEnvelope, ExecutionEvent, ExecutionStateMachine, StageTransition, TransitionOutcome,
};
pub use graph::{
    auto_layout_graph, compute_ranks, find_entry_stages, find_exit_stages, graph_to_stages,
    refresh_configuration, stages_to_graph, validate_pipeline_graph, GraphEdge, GraphNode,
    LayoutOptions, PipelineGraph, StageNodeData, ValidationIssue, ValidationReport,
};
pub use store::SqlitePipelineStore;
