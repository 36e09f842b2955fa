//! Per-mission execution tracking.
//!
//! A mission assigned to a team pipeline gets one `PipelineStageExecution`
//! per configured stage. Progress arrives as `ExecutionEvent`s from the
//! orchestration side, possibly duplicated or out of order across parallel
//! branches; `ExecutionStateMachine` applies each one independently and
//! idempotently.

pub mod event;
pub mod machine;

pub use event::{EventEnvelope, ExecutionEvent, StageTransition, TransitionOutcome};
pub use machine::ExecutionStateMachine;
