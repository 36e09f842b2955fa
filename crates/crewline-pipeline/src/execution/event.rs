use serde::{Deserialize, Serialize};

use crewline_core::execution::{LogLevel, StageStatus};

/// A progress event for one stage of a mission run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExecutionEvent {
    /// Agents picked the stage up. Empty `agent_ids` means the stage's assigned agents.
    StartStage {
        stage_id: String,
        #[serde(default)]
        agent_ids: Vec<String>,
    },
    /// The stage finished. A pending stage is promoted through `active` first.
    CompleteStage {
        stage_id: String,
        #[serde(default)]
        commits: Vec<String>,
        #[serde(default)]
        cost: f64,
        #[serde(default)]
        notes: Option<String>,
    },
    BlockStage {
        stage_id: String,
        #[serde(default)]
        reason: String,
    },
    /// A blocked stage can continue.
    ResolveStage { stage_id: String },
    /// Bypass an optional stage.
    SkipStage { stage_id: String },
    /// External choice of the single successor a conditional stage continues with.
    DecideBranch {
        stage_id: String,
        chosen_stage_id: String,
    },
    AppendLog {
        stage_id: String,
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
}

impl ExecutionEvent {
    pub fn stage_id(&self) -> &str {
        match self {
            Self::StartStage { stage_id, .. }
            | Self::CompleteStage { stage_id, .. }
            | Self::BlockStage { stage_id, .. }
            | Self::ResolveStage { stage_id }
            | Self::SkipStage { stage_id }
            | Self::DecideBranch { stage_id, .. }
            | Self::AppendLog { stage_id, .. } => stage_id,
        }
    }

    pub fn complete(stage_id: impl Into<String>, commits: Vec<String>, cost: f64) -> Self {
        Self::CompleteStage {
            stage_id: stage_id.into(),
            commits,
            cost,
            notes: None,
        }
    }

    pub fn start(stage_id: impl Into<String>) -> Self {
        Self::StartStage {
            stage_id: stage_id.into(),
            agent_ids: vec![],
        }
    }
}

/// An event as delivered by the orchestration source.
///
/// Delivery is at-least-once; when `event_id` is set, a redelivered event is
/// recognised and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(default)]
    pub event_id: Option<String>,
    pub event: ExecutionEvent,
}

impl EventEnvelope {
    pub fn new(event_id: impl Into<String>, event: ExecutionEvent) -> Self {
        Self {
            event_id: Some(event_id.into()),
            event,
        }
    }
}

impl From<ExecutionEvent> for EventEnvelope {
    fn from(event: ExecutionEvent) -> Self {
        Self {
            event_id: None,
            event,
        }
    }
}

/// One status change of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    pub stage_id: String,
    pub from: StageStatus,
    pub to: StageStatus,
}

/// What applying an event did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The execution changed. `transitions` is empty for record-only events
    /// (logs, branch decisions with nothing to skip, new agents on an active stage).
    Applied { transitions: Vec<StageTransition> },
    /// Nothing changed (already in the target state, or a redelivered event).
    NoOp { reason: String },
}

impl TransitionOutcome {
    pub fn is_no_op(&self) -> bool {
        matches!(self, Self::NoOp { .. })
    }

    pub fn transitions(&self) -> &[StageTransition] {
        match self {
            Self::Applied { transitions } => transitions,
            Self::NoOp { .. } => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = r#"{"eventId": "evt-1", "event": {"type": "complete_stage", "stageId": "s1", "commits": ["abc"], "cost": 2}}"#;
        let envelope: EventEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.event_id.as_deref(), Some("evt-1"));
        assert_eq!(
            envelope.event,
            ExecutionEvent::CompleteStage {
                stage_id: "s1".into(),
                commits: vec!["abc".into()],
                cost: 2.0,
                notes: None,
            }
        );
        assert_eq!(envelope.event.stage_id(), "s1");
    }

    #[test]
    fn test_envelope_without_id() {
        let json = r#"{"event": {"type": "skip_stage", "stageId": "docs"}}"#;
        let envelope: EventEnvelope = serde_json::from_str(json).unwrap();
        assert!(envelope.event_id.is_none());
        assert!(matches!(envelope.event, ExecutionEvent::SkipStage { .. }));
    }

    #[test]
    fn test_event_fields_are_camel_case() {
        let event = ExecutionEvent::DecideBranch {
            stage_id: "review".into(),
            chosen_stage_id: "merge".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "decide_branch");
        assert_eq!(json["stageId"], "review");
        assert_eq!(json["chosenStageId"], "merge");

        let start: ExecutionEvent =
            serde_json::from_str(r#"{"type": "start_stage", "stageId": "s2", "agentIds": ["coder"]}"#)
                .unwrap();
        assert_eq!(
            start,
            ExecutionEvent::StartStage {
                stage_id: "s2".into(),
                agent_ids: vec!["coder".into()],
            }
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = TransitionOutcome::Applied {
            transitions: vec![StageTransition {
                stage_id: "s1".into(),
                from: StageStatus::Pending,
                to: StageStatus::Active,
            }],
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "applied");
        assert_eq!(json["transitions"][0]["to"], "active");
        assert_eq!(outcome.transitions().len(), 1);
        assert!(!outcome.is_no_op());
    }
}
