//! Runtime records of a mission's progress through its team pipeline.
//!
//! These are the shapes the mission execution surface reads and writes. They
//! are keyed by stage id but never touched by the pipeline editor.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress state of one stage within a mission run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Skipped,
    Blocked,
}

impl StageStatus {
    /// `Completed` and `Skipped` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageLogs {
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

impl StageLogs {
    /// Append an entry, dropping the oldest ones beyond `cap` (0 = unbounded).
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>, cap: usize) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        if cap > 0 && self.entries.len() > cap {
            let overflow = self.entries.len() - cap;
            self.entries.drain(..overflow);
        }
    }
}

/// Runtime record for one stage of one mission run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStageExecution {
    pub stage_id: String,
    #[serde(default)]
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub active_agent_ids: Vec<String>,
    #[serde(default)]
    pub commits: Vec<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub logs: StageLogs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl PipelineStageExecution {
    pub fn pending(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            status: StageStatus::Pending,
            started_at: None,
            completed_at: None,
            active_agent_ids: vec![],
            commits: vec![],
            cost: 0.0,
            logs: StageLogs::default(),
            notes: None,
        }
    }
}

/// Runtime record of one mission's pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    pub mission_id: String,
    pub pipeline_id: String,
    pub stages: Vec<PipelineStageExecution>,
    /// Always the sum of every stage's `cost`.
    #[serde(default)]
    pub total_cost: f64,
    /// Conditional stage id -> chosen successor id.
    #[serde(default)]
    pub branch_decisions: HashMap<String, String>,
    #[serde(default)]
    pub processed_event_ids: HashSet<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl PipelineExecution {
    pub fn new(
        mission_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        stages: Vec<PipelineStageExecution>,
    ) -> Self {
        let mut execution = Self {
            mission_id: mission_id.into(),
            pipeline_id: pipeline_id.into(),
            stages,
            total_cost: 0.0,
            branch_decisions: HashMap::new(),
            processed_event_ids: HashSet::new(),
            updated_at: Utc::now(),
        };
        execution.recompute_total_cost();
        execution
    }

    pub fn stage(&self, stage_id: &str) -> Option<&PipelineStageExecution> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut PipelineStageExecution> {
        self.stages.iter_mut().find(|s| s.stage_id == stage_id)
    }

    pub fn status_of(&self, stage_id: &str) -> Option<StageStatus> {
        self.stage(stage_id).map(|s| s.status)
    }

    pub fn recompute_total_cost(&mut self) {
        self.total_cost = self.stages.iter().map(|s| s.cost).sum();
    }

    /// Union of `active_agent_ids` across every stage currently `Active`.
    pub fn active_agent_ids(&self) -> BTreeSet<String> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Active)
            .flat_map(|s| s.active_agent_ids.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(StageStatus::Completed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
        assert!(!StageStatus::Blocked.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
    }

    #[test]
    fn test_total_cost_and_active_agents() {
        let mut a = PipelineStageExecution::pending("a");
        a.status = StageStatus::Active;
        a.cost = 1.5;
        a.active_agent_ids = vec!["alice".into(), "bob".into()];

        let mut b = PipelineStageExecution::pending("b");
        b.status = StageStatus::Completed;
        b.cost = 2.25;
        b.active_agent_ids = vec!["carol".into()];

        let mut c = PipelineStageExecution::pending("c");
        c.status = StageStatus::Active;
        c.active_agent_ids = vec!["bob".into()];

        let execution = PipelineExecution::new("m1", "p1", vec![a, b, c]);
        assert_eq!(execution.total_cost, 3.75);

        let active: Vec<_> = execution.active_agent_ids().into_iter().collect();
        assert_eq!(active, vec!["alice", "bob"]);
    }

    #[test]
    fn test_log_cap_drops_oldest() {
        let mut logs = StageLogs::default();
        for i in 0..5 {
            logs.push(LogLevel::Info, format!("entry {}", i), 3);
        }
        assert_eq!(logs.entries.len(), 3);
        assert_eq!(logs.entries[0].message, "entry 2");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&StageStatus::Blocked).unwrap();
        assert_eq!(json, "\"blocked\"");
    }
}
