use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 2D coordinate of a stage on the editor canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Successor semantics of a stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchType {
    /// Successors follow once this stage completes.
    #[default]
    Sequential,
    /// Every successor may run at the same time.
    Parallel,
    /// Exactly one successor runs, chosen by an external decision.
    Conditional,
}

impl std::fmt::Display for BranchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Conditional => "conditional",
        };
        f.write_str(s)
    }
}

/// How a stage with several predecessors waits for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinPolicy {
    /// Every predecessor marked `required_for_completion` must be completed.
    #[default]
    All,
    /// Any single completed predecessor is enough.
    Any,
}

/// One node of a pipeline's workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Unique within its configuration.
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assigned_agent_ids: Vec<String>,
    /// Display hint only; edges define the actual flow.
    #[serde(default)]
    pub order: u32,
    /// Successor edges.
    #[serde(default)]
    pub next_stage_ids: Vec<String>,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub branch_type: BranchType,
    #[serde(default)]
    pub join_policy: JoinPolicy,
    #[serde(default = "default_stage_color")]
    pub color: String,
    #[serde(default = "default_required")]
    pub required_for_completion: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<String>,
}

fn default_stage_color() -> String {
    "#6366f1".to_string()
}

fn default_required() -> bool {
    true
}

impl Stage {
    /// Create a required, sequential stage with no successors.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            assigned_agent_ids: vec![],
            order: 0,
            next_stage_ids: vec![],
            position: Position::default(),
            branch_type: BranchType::default(),
            join_policy: JoinPolicy::default(),
            color: default_stage_color(),
            required_for_completion: true,
            estimated_duration: None,
        }
    }

    pub fn with_next<I, S>(mut self, next: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_stage_ids = next.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.assigned_agent_ids = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_branch(mut self, branch_type: BranchType) -> Self {
        self.branch_type = branch_type;
        self
    }

    pub fn with_join(mut self, join_policy: JoinPolicy) -> Self {
        self.join_policy = join_policy;
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    /// Mark the stage as optional (skippable by a branch decision).
    pub fn optional(mut self) -> Self {
        self.required_for_completion = false;
        self
    }

    /// A stage with no outgoing edge.
    pub fn is_exit(&self) -> bool {
        self.next_stage_ids.is_empty()
    }
}

/// The persisted stage graph of a team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfiguration {
    #[serde(default = "new_pipeline_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Recomputed from `stages`, never edited by hand.
    #[serde(default)]
    pub entry_stage_ids: Vec<String>,
    #[serde(default)]
    pub is_valid: bool,
    #[serde(default)]
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn new_pipeline_id() -> String {
    Uuid::new_v4().to_string()
}

impl PipelineConfiguration {
    /// Create an empty, not-yet-validated configuration.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_pipeline_id(),
            name: name.into(),
            description: String::new(),
            stages: vec![],
            entry_stage_ids: vec![],
            is_valid: false,
            validation_errors: vec![],
            validation_warnings: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Store the outcome of a validation pass.
    pub fn record_validation(
        &mut self,
        entry_stage_ids: Vec<String>,
        is_valid: bool,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) {
        self.entry_stage_ids = entry_stage_ids;
        self.is_valid = is_valid;
        self.validation_errors = errors;
        self.validation_warnings = warnings;
        self.updated_at = Utc::now();
    }
}

/// A pipeline as supplied by a caller: a full configuration or a bare stage list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PipelineDocument {
    Stages(Vec<Stage>),
    Configuration(PipelineConfiguration),
}

impl PipelineDocument {
    /// A bare stage list is wrapped in a new configuration called `name`.
    pub fn into_configuration(self, name: &str) -> PipelineConfiguration {
        match self {
            Self::Stages(stages) => PipelineConfiguration::new(name).with_stages(stages),
            Self::Configuration(config) => config,
        }
    }
}

/// Display metadata of an agent, resolved from the agent directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub emoji: String,
    #[serde(default)]
    pub color: String,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            emoji: String::new(),
            color: String::new(),
        }
    }
}

/// Read-only lookup from agent id to display metadata.
pub trait AgentDirectory: Send + Sync {
    fn resolve(&self, agent_id: &str) -> Option<AgentProfile>;
}

impl AgentDirectory for HashMap<String, AgentProfile> {
    fn resolve(&self, agent_id: &str) -> Option<AgentProfile> {
        self.get(agent_id).cloned()
    }
}

impl AgentDirectory for [AgentProfile] {
    fn resolve(&self, agent_id: &str) -> Option<AgentProfile> {
        self.iter().find(|a| a.id == agent_id).cloned()
    }
}

impl AgentDirectory for Vec<AgentProfile> {
    fn resolve(&self, agent_id: &str) -> Option<AgentProfile> {
        self.as_slice().resolve(agent_id)
    }
}
