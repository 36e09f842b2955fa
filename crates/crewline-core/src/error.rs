use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrewlineError {
    // Execution errors
    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("Invalid transition for stage {stage_id}: {from} -> {to}")]
    InvalidTransition {
        stage_id: String,
        from: String,
        to: String,
    },

    #[error("Stage {stage_id} is waiting on predecessors: {}", waiting_on.join(", "))]
    PredecessorsIncomplete {
        stage_id: String,
        waiting_on: Vec<String>,
    },

    #[error("Stage {stage_id} was not chosen by conditional stage(s): {}", decided_by.join(", "))]
    BranchNotChosen {
        stage_id: String,
        decided_by: Vec<String>,
    },

    #[error("Invalid branch decision on {stage_id}: {message}")]
    InvalidBranchDecision { stage_id: String, message: String },

    #[error("Stage {0} is required for completion and cannot be skipped")]
    SkipRequired(String),

    // Pipeline store errors
    #[error("Pipeline {id} is invalid ({errors} blocking error(s)) and cannot be activated")]
    PipelineInvalid { id: String, errors: usize },

    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline {id} belongs to team {team_id}")]
    PipelineOwnedElsewhere { id: String, team_id: String },

    #[error("Pipeline {id} is referenced by mission {mission_id}")]
    PipelineInUse { id: String, mission_id: String },

    #[error("Execution not found for mission: {0}")]
    ExecutionNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CrewlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predecessor_message_lists_ids() {
        let err = CrewlineError::PredecessorsIncomplete {
            stage_id: "review".into(),
            waiting_on: vec!["build".into(), "lint".into()],
        };
        assert_eq!(
            err.to_string(),
            "Stage review is waiting on predecessors: build, lint"
        );
    }

    #[test]
    fn test_json_error_converts() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{");
        let err: CrewlineError = parse.unwrap_err().into();
        assert!(matches!(err, CrewlineError::Json(_)));
    }
}
