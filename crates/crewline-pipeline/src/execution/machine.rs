use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use crewline_core::config::ExecutionConfig;
use crewline_core::error::{CrewlineError, Result};
use crewline_core::execution::{
    LogLevel, PipelineExecution, PipelineStageExecution, StageStatus,
};
use crewline_core::types::{BranchType, JoinPolicy, PipelineConfiguration};

use super::event::{EventEnvelope, ExecutionEvent, StageTransition, TransitionOutcome};
use crate::graph::find_entry_stages;

/// Static facts about one stage, taken from the configuration.
#[derive(Debug, Clone)]
struct StageTopology {
    required: bool,
    branch_type: BranchType,
    join_policy: JoinPolicy,
    assigned_agent_ids: Vec<String>,
    successors: Vec<String>,
    predecessors: Vec<String>,
}

/// Drives the stage records of one mission run.
///
/// Transitions: `pending -> active -> {completed | blocked}`,
/// `blocked -> active`, `pending -> skipped`. `completed` and `skipped` are
/// terminal. A pending stage may activate once its predecessors allow it
/// (see [`ExecutionStateMachine::check_ready`]); entry stages always may.
#[derive(Debug, Clone)]
pub struct ExecutionStateMachine {
    topology: HashMap<String, StageTopology>,
    entry_stage_ids: HashSet<String>,
    execution: PipelineExecution,
    max_log_entries: usize,
}

impl ExecutionStateMachine {
    /// Start a fresh run: one pending record per configured stage, entry
    /// stages activated when `auto_activate_entries` is set.
    pub fn new(
        config: &PipelineConfiguration,
        mission_id: impl Into<String>,
        options: &ExecutionConfig,
    ) -> Self {
        let (topology, order) = build_topology(config);
        let entry_stage_ids: HashSet<String> =
            find_entry_stages(&config.stages).into_iter().collect();

        let records = order
            .iter()
            .map(|id| PipelineStageExecution::pending(id.clone()))
            .collect();

        let mut machine = Self {
            topology,
            entry_stage_ids,
            execution: PipelineExecution::new(mission_id, config.id.clone(), records),
            max_log_entries: options.max_log_entries,
        };

        if options.auto_activate_entries {
            for id in &order {
                if machine.entry_stage_ids.contains(id) {
                    let agents = machine
                        .topology
                        .get(id)
                        .map(|t| t.assigned_agent_ids.clone())
                        .unwrap_or_default();
                    if let Err(e) = machine.activate(id, agents, "Stage activated as pipeline entry") {
                        warn!(stage_id = %id, error = %e, "Failed to activate entry stage");
                    }
                }
            }
        }

        info!(
            mission_id = %machine.execution.mission_id,
            pipeline_id = %machine.execution.pipeline_id,
            stages = order.len(),
            "Pipeline execution created"
        );
        machine
    }

    /// Continue a persisted run against its configuration. Stages added to
    /// the configuration since the run started get pending records.
    pub fn resume(
        config: &PipelineConfiguration,
        mut execution: PipelineExecution,
        options: &ExecutionConfig,
    ) -> Self {
        let (topology, order) = build_topology(config);
        for id in &order {
            if execution.stage(id).is_none() {
                execution.stages.push(PipelineStageExecution::pending(id.clone()));
            }
        }
        execution.recompute_total_cost();

        Self {
            topology,
            entry_stage_ids: find_entry_stages(&config.stages).into_iter().collect(),
            execution,
            max_log_entries: options.max_log_entries,
        }
    }

    pub fn execution(&self) -> &PipelineExecution {
        &self.execution
    }

    pub fn into_execution(self) -> PipelineExecution {
        self.execution
    }

    pub fn mission_id(&self) -> &str {
        &self.execution.mission_id
    }

    pub fn status(&self, stage_id: &str) -> Option<StageStatus> {
        self.execution.status_of(stage_id)
    }

    pub fn total_cost(&self) -> f64 {
        self.execution.total_cost
    }

    /// Agents working on any currently active stage.
    pub fn active_agent_ids(&self) -> BTreeSet<String> {
        self.execution.active_agent_ids()
    }

    /// Pending stages that may activate now, in configuration order.
    pub fn ready_stages(&self) -> Vec<String> {
        self.execution
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Pending)
            .filter(|s| self.check_ready(&s.stage_id).is_ok())
            .map(|s| s.stage_id.clone())
            .collect()
    }

    /// Nothing is running and every required stage is completed.
    pub fn is_finished(&self) -> bool {
        let idle = self
            .execution
            .stages
            .iter()
            .all(|s| !matches!(s.status, StageStatus::Active | StageStatus::Blocked));
        idle && self
            .topology
            .iter()
            .filter(|(_, t)| t.required)
            .all(|(id, _)| self.status(id) == Some(StageStatus::Completed))
    }

    /// Apply a delivered event, ignoring redeliveries of an already applied `event_id`.
    pub fn apply(&mut self, envelope: EventEnvelope) -> Result<TransitionOutcome> {
        if let Some(id) = &envelope.event_id {
            if self.execution.processed_event_ids.contains(id) {
                debug!(mission_id = %self.execution.mission_id, event_id = %id, "Duplicate event ignored");
                return Ok(TransitionOutcome::NoOp {
                    reason: format!("duplicate event {}", id),
                });
            }
        }

        let outcome = self.apply_event(envelope.event)?;

        if let Some(id) = envelope.event_id {
            self.execution.processed_event_ids.insert(id);
        }
        Ok(outcome)
    }

    /// Apply one event. Errors leave the execution untouched.
    pub fn apply_event(&mut self, event: ExecutionEvent) -> Result<TransitionOutcome> {
        let stage_id = event.stage_id().to_string();
        if !self.topology.contains_key(&stage_id) || self.execution.stage(&stage_id).is_none() {
            return Err(CrewlineError::StageNotFound(stage_id));
        }

        let outcome = match event {
            ExecutionEvent::StartStage {
                stage_id,
                agent_ids,
            } => self.start(&stage_id, agent_ids)?,
            ExecutionEvent::CompleteStage {
                stage_id,
                commits,
                cost,
                notes,
            } => self.complete(&stage_id, commits, cost, notes)?,
            ExecutionEvent::BlockStage { stage_id, reason } => self.block(&stage_id, &reason)?,
            ExecutionEvent::ResolveStage { stage_id } => self.resolve(&stage_id)?,
            ExecutionEvent::SkipStage { stage_id } => self.skip(&stage_id)?,
            ExecutionEvent::DecideBranch {
                stage_id,
                chosen_stage_id,
            } => self.decide_branch(&stage_id, chosen_stage_id)?,
            ExecutionEvent::AppendLog {
                stage_id,
                level,
                message,
            } => {
                let cap = self.max_log_entries;
                self.record(&stage_id)?.logs.push(level, message, cap);
                TransitionOutcome::Applied {
                    transitions: vec![],
                }
            }
        };

        match &outcome {
            TransitionOutcome::Applied { transitions } => {
                self.execution.recompute_total_cost();
                self.execution.updated_at = Utc::now();
                for t in transitions {
                    info!(
                        mission_id = %self.execution.mission_id,
                        stage_id = %t.stage_id,
                        from = %t.from,
                        to = %t.to,
                        "Stage transitioned"
                    );
                }
            }
            TransitionOutcome::NoOp { reason } => {
                debug!(mission_id = %self.execution.mission_id, stage_id = %stage_id, reason = %reason, "Event was a no-op");
            }
        }
        Ok(outcome)
    }

    /// Whether a pending stage may become active.
    ///
    /// Entry stages always may. Otherwise: when any predecessor is
    /// conditional, one of them must have chosen this stage; then the join
    /// policy applies (`all`: every required predecessor completed, `any`: at
    /// least one predecessor completed).
    pub fn check_ready(&self, stage_id: &str) -> Result<()> {
        if self.entry_stage_ids.contains(stage_id) {
            return Ok(());
        }
        let topo = self.topo(stage_id)?;

        let conditional: Vec<String> = topo
            .predecessors
            .iter()
            .filter(|p| {
                self.topology
                    .get(*p)
                    .is_some_and(|t| t.branch_type == BranchType::Conditional)
            })
            .cloned()
            .collect();
        if !conditional.is_empty() {
            let chosen = conditional.iter().any(|p| {
                self.execution
                    .branch_decisions
                    .get(p)
                    .is_some_and(|c| c == stage_id)
            });
            if !chosen {
                return Err(CrewlineError::BranchNotChosen {
                    stage_id: stage_id.to_string(),
                    decided_by: conditional,
                });
            }
        }

        let completed = |id: &String| self.status(id) == Some(StageStatus::Completed);
        let waiting_on: Vec<String> = match topo.join_policy {
            JoinPolicy::All => topo
                .predecessors
                .iter()
                .filter(|p| self.topology.get(*p).is_some_and(|t| t.required))
                .filter(|p| !completed(p))
                .cloned()
                .collect(),
            JoinPolicy::Any => {
                if topo.predecessors.is_empty() || topo.predecessors.iter().any(completed) {
                    vec![]
                } else {
                    topo.predecessors.clone()
                }
            }
        };

        if waiting_on.is_empty() {
            Ok(())
        } else {
            Err(CrewlineError::PredecessorsIncomplete {
                stage_id: stage_id.to_string(),
                waiting_on,
            })
        }
    }

    fn start(&mut self, stage_id: &str, agent_ids: Vec<String>) -> Result<TransitionOutcome> {
        match self.current(stage_id) {
            StageStatus::Pending => {
                self.check_ready(stage_id)?;
                let agents = if agent_ids.is_empty() {
                    self.topo(stage_id)?.assigned_agent_ids.clone()
                } else {
                    agent_ids
                };
                let t = self.activate(stage_id, agents, "Stage started")?;
                Ok(TransitionOutcome::Applied {
                    transitions: vec![t],
                })
            }
            StageStatus::Blocked => self.resolve(stage_id),
            StageStatus::Active => {
                let cap = self.max_log_entries;
                let record = self.record(stage_id)?;
                let mut added = Vec::new();
                for agent in agent_ids {
                    if !record.active_agent_ids.contains(&agent) && !added.contains(&agent) {
                        added.push(agent);
                    }
                }
                if added.is_empty() {
                    return Ok(no_op("stage already active"));
                }
                record
                    .logs
                    .push(LogLevel::Info, format!("Agents joined: {}", added.join(", ")), cap);
                record.active_agent_ids.extend(added);
                Ok(TransitionOutcome::Applied {
                    transitions: vec![],
                })
            }
            status => Ok(no_op(format!("stage already {}", status))),
        }
    }

    fn complete(
        &mut self,
        stage_id: &str,
        commits: Vec<String>,
        cost: f64,
        notes: Option<String>,
    ) -> Result<TransitionOutcome> {
        let mut transitions = Vec::new();
        match self.current(stage_id) {
            StageStatus::Completed => return Ok(no_op("stage already completed")),
            from @ (StageStatus::Skipped | StageStatus::Blocked) => {
                return Err(invalid(stage_id, from, StageStatus::Completed));
            }
            StageStatus::Pending => {
                // Promote through active without leaving a half-applied state
                self.check_ready(stage_id)?;
                let agents = self.topo(stage_id)?.assigned_agent_ids.clone();
                transitions.push(self.activate(stage_id, agents, "Stage started")?);
            }
            StageStatus::Active => {}
        }

        let cap = self.max_log_entries;
        let record = self.record(stage_id)?;
        let mut new_commits = 0;
        for commit in commits {
            if !record.commits.contains(&commit) {
                record.commits.push(commit);
                new_commits += 1;
            }
        }
        if cost.is_finite() && cost > 0.0 {
            record.cost += cost;
        }
        if notes.is_some() {
            record.notes = notes;
        }
        record.status = StageStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.logs.push(
            LogLevel::Info,
            format!("Stage completed ({} commit(s), cost {:.2})", new_commits, cost.max(0.0)),
            cap,
        );

        transitions.push(StageTransition {
            stage_id: stage_id.to_string(),
            from: StageStatus::Active,
            to: StageStatus::Completed,
        });
        Ok(TransitionOutcome::Applied { transitions })
    }

    fn block(&mut self, stage_id: &str, reason: &str) -> Result<TransitionOutcome> {
        match self.current(stage_id) {
            StageStatus::Active => {
                let cap = self.max_log_entries;
                let record = self.record(stage_id)?;
                record.status = StageStatus::Blocked;
                let message = if reason.is_empty() {
                    "Stage blocked".to_string()
                } else {
                    format!("Stage blocked: {}", reason)
                };
                record.logs.push(LogLevel::Warn, message, cap);
                Ok(applied(stage_id, StageStatus::Active, StageStatus::Blocked))
            }
            StageStatus::Blocked => Ok(no_op("stage already blocked")),
            from => Err(invalid(stage_id, from, StageStatus::Blocked)),
        }
    }

    fn resolve(&mut self, stage_id: &str) -> Result<TransitionOutcome> {
        match self.current(stage_id) {
            StageStatus::Blocked => {
                let cap = self.max_log_entries;
                let record = self.record(stage_id)?;
                record.status = StageStatus::Active;
                record.logs.push(LogLevel::Info, "Stage unblocked", cap);
                Ok(applied(stage_id, StageStatus::Blocked, StageStatus::Active))
            }
            StageStatus::Active => Ok(no_op("stage already active")),
            from => Err(invalid(stage_id, from, StageStatus::Active)),
        }
    }

    fn skip(&mut self, stage_id: &str) -> Result<TransitionOutcome> {
        match self.current(stage_id) {
            StageStatus::Skipped => Ok(no_op("stage already skipped")),
            StageStatus::Pending => {
                if self.topo(stage_id)?.required {
                    return Err(CrewlineError::SkipRequired(stage_id.to_string()));
                }
                let t = self.mark_skipped(stage_id, "Stage skipped")?;
                Ok(TransitionOutcome::Applied {
                    transitions: vec![t],
                })
            }
            from => Err(invalid(stage_id, from, StageStatus::Skipped)),
        }
    }

    fn decide_branch(&mut self, stage_id: &str, chosen: String) -> Result<TransitionOutcome> {
        let topo = self.topo(stage_id)?;
        if topo.branch_type != BranchType::Conditional {
            return Err(CrewlineError::InvalidBranchDecision {
                stage_id: stage_id.to_string(),
                message: format!("stage is {}, not conditional", topo.branch_type),
            });
        }
        if !topo.successors.contains(&chosen) {
            return Err(CrewlineError::InvalidBranchDecision {
                stage_id: stage_id.to_string(),
                message: format!("{} is not a successor", chosen),
            });
        }
        match self.execution.branch_decisions.get(stage_id) {
            Some(previous) if *previous == chosen => {
                return Ok(no_op("branch already decided"));
            }
            Some(previous) => {
                return Err(CrewlineError::InvalidBranchDecision {
                    stage_id: stage_id.to_string(),
                    message: format!("already decided for {}", previous),
                });
            }
            None => {}
        }

        let mut candidates: Vec<String> = topo
            .successors
            .iter()
            .filter(|s| **s != chosen)
            .cloned()
            .collect();

        let cap = self.max_log_entries;
        self.record(stage_id)?
            .logs
            .push(LogLevel::Info, format!("Branch decided: {}", chosen), cap);
        self.execution
            .branch_decisions
            .insert(stage_id.to_string(), chosen);

        // Skip optional stages no longer reachable through any live route
        let mut transitions = Vec::new();
        while let Some(candidate) = candidates.pop() {
            if self.current(&candidate) != StageStatus::Pending || !self.is_bypassed(&candidate) {
                continue;
            }
            let Some(topo) = self.topology.get(&candidate) else {
                continue;
            };
            if topo.required {
                warn!(
                    mission_id = %self.execution.mission_id,
                    stage_id = %candidate,
                    "Required stage bypassed by branch decision"
                );
                continue;
            }
            candidates.extend(topo.successors.iter().cloned());
            let reason = format!("Skipped by branch decision on {}", stage_id);
            transitions.push(self.mark_skipped(&candidate, &reason)?);
        }

        Ok(TransitionOutcome::Applied { transitions })
    }

    /// Every predecessor is skipped or is a conditional stage that chose elsewhere.
    fn is_bypassed(&self, stage_id: &str) -> bool {
        let Some(topo) = self.topology.get(stage_id) else {
            return false;
        };
        !topo.predecessors.is_empty()
            && topo.predecessors.iter().all(|p| {
                self.status(p) == Some(StageStatus::Skipped)
                    || self
                        .execution
                        .branch_decisions
                        .get(p)
                        .is_some_and(|c| c != stage_id)
            })
    }

    fn activate(
        &mut self,
        stage_id: &str,
        agent_ids: Vec<String>,
        message: &str,
    ) -> Result<StageTransition> {
        let cap = self.max_log_entries;
        let record = self.record(stage_id)?;
        let from = record.status;
        record.status = StageStatus::Active;
        record.started_at.get_or_insert_with(Utc::now);
        record.active_agent_ids = agent_ids;
        record.logs.push(LogLevel::Info, message, cap);
        Ok(StageTransition {
            stage_id: stage_id.to_string(),
            from,
            to: StageStatus::Active,
        })
    }

    fn mark_skipped(&mut self, stage_id: &str, message: &str) -> Result<StageTransition> {
        let cap = self.max_log_entries;
        let record = self.record(stage_id)?;
        let from = record.status;
        record.status = StageStatus::Skipped;
        record.logs.push(LogLevel::Info, message, cap);
        Ok(StageTransition {
            stage_id: stage_id.to_string(),
            from,
            to: StageStatus::Skipped,
        })
    }

    fn current(&self, stage_id: &str) -> StageStatus {
        self.status(stage_id).unwrap_or_default()
    }

    fn topo(&self, stage_id: &str) -> Result<&StageTopology> {
        self.topology
            .get(stage_id)
            .ok_or_else(|| CrewlineError::StageNotFound(stage_id.to_string()))
    }

    fn record(&mut self, stage_id: &str) -> Result<&mut PipelineStageExecution> {
        self.execution
            .stage_mut(stage_id)
            .ok_or_else(|| CrewlineError::StageNotFound(stage_id.to_string()))
    }
}

/// Topology per stage id plus the de-duplicated id order.
fn build_topology(config: &PipelineConfiguration) -> (HashMap<String, StageTopology>, Vec<String>) {
    let mut topology: HashMap<String, StageTopology> = HashMap::new();
    let mut order = Vec::new();

    for stage in &config.stages {
        if topology.contains_key(&stage.id) {
            continue;
        }
        order.push(stage.id.clone());
        topology.insert(
            stage.id.clone(),
            StageTopology {
                required: stage.required_for_completion,
                branch_type: stage.branch_type,
                join_policy: stage.join_policy,
                assigned_agent_ids: stage.assigned_agent_ids.clone(),
                successors: vec![],
                predecessors: vec![],
            },
        );
    }

    let mut links = Vec::new();
    for stage in &config.stages {
        for next in &stage.next_stage_ids {
            if topology.contains_key(next) && !links.contains(&(stage.id.clone(), next.clone())) {
                links.push((stage.id.clone(), next.clone()));
            }
        }
    }
    for (from, to) in links {
        if let Some(t) = topology.get_mut(&from) {
            t.successors.push(to.clone());
        }
        if let Some(t) = topology.get_mut(&to) {
            t.predecessors.push(from);
        }
    }

    (topology, order)
}

fn applied(stage_id: &str, from: StageStatus, to: StageStatus) -> TransitionOutcome {
    TransitionOutcome::Applied {
        transitions: vec![StageTransition {
            stage_id: stage_id.to_string(),
            from,
            to,
        }],
    }
}

fn no_op(reason: impl Into<String>) -> TransitionOutcome {
    TransitionOutcome::NoOp {
        reason: reason.into(),
    }
}

fn invalid(stage_id: &str, from: StageStatus, to: StageStatus) -> CrewlineError {
    CrewlineError::InvalidTransition {
        stage_id: stage_id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
