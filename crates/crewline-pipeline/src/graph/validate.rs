use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crewline_core::types::{PipelineConfiguration, Stage};

use super::entry::find_entry_stages;

/// A structural finding about a stage list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ValidationIssue {
    #[error("duplicate stage id: {stage_id}")]
    DuplicateStageId { stage_id: String },

    #[error("dangling reference: stage {from} points to missing stage {to}")]
    DanglingReference { from: String, to: String },

    /// `stage_ids` lists the cycle in traversal order; the last one links back to the first.
    #[error("cycle detected: {} -> {}", stage_ids.join(" -> "), stage_ids.first().map(String::as_str).unwrap_or(""))]
    Cycle { stage_ids: Vec<String> },

    #[error("no entry point: every stage has an incoming edge")]
    NoEntryPoint,

    #[error("unreachable stage: {stage_id} cannot be reached from any entry stage")]
    UnreachableStage { stage_id: String },
}

impl ValidationIssue {
    /// Blocking issues keep a configuration from becoming valid; the rest are advisory.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, Self::UnreachableStage { .. })
    }

    /// Stage ids this issue is about.
    pub fn stage_ids(&self) -> Vec<&str> {
        match self {
            Self::DuplicateStageId { stage_id } | Self::UnreachableStage { stage_id } => {
                vec![stage_id.as_str()]
            }
            Self::DanglingReference { from, .. } => vec![from.as_str()],
            Self::Cycle { stage_ids } => stage_ids.iter().map(String::as_str).collect(),
            Self::NoEntryPoint => vec![],
        }
    }
}

/// Outcome of validating a stage list. Never an error: findings are data.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub entry_stage_ids: Vec<String>,
}

impl ValidationReport {
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }

    pub fn has_cycle(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, ValidationIssue::Cycle { .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored.
    Black,
}

/// Check that a stage list forms a sound workflow.
///
/// Blocking: duplicate ids, dangling references, cycles, no entry stage.
/// Advisory: stages that no entry stage can reach (a stage may be unwired
/// mid-edit).
pub fn validate_pipeline_graph(stages: &[Stage]) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Ids in list order, duplicates reported once each
    let mut order: Vec<&str> = Vec::with_capacity(stages.len());
    let mut known: HashSet<&str> = HashSet::with_capacity(stages.len());
    let mut reported_dupes: HashSet<&str> = HashSet::new();
    for stage in stages {
        if known.insert(stage.id.as_str()) {
            order.push(stage.id.as_str());
        } else if reported_dupes.insert(stage.id.as_str()) {
            errors.push(ValidationIssue::DuplicateStageId {
                stage_id: stage.id.clone(),
            });
        }
    }

    // Adjacency over existing targets only
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::with_capacity(order.len());
    for stage in stages {
        let targets = adjacency.entry(stage.id.as_str()).or_default();
        for next in &stage.next_stage_ids {
            if known.contains(next.as_str()) {
                if !targets.contains(&next.as_str()) {
                    targets.push(next.as_str());
                }
            } else {
                errors.push(ValidationIssue::DanglingReference {
                    from: stage.id.clone(),
                    to: next.clone(),
                });
            }
        }
    }

    for cycle in detect_cycles(&order, &adjacency) {
        errors.push(ValidationIssue::Cycle { stage_ids: cycle });
    }

    let entry_stage_ids = find_entry_stages(stages);
    if entry_stage_ids.is_empty() {
        errors.push(ValidationIssue::NoEntryPoint);
    } else {
        let reached = reachable_from(&entry_stage_ids, &adjacency);
        for id in &order {
            if !reached.contains(id) {
                warnings.push(ValidationIssue::UnreachableStage {
                    stage_id: (*id).to_string(),
                });
            }
        }
    }

    let is_valid = !errors.iter().any(ValidationIssue::is_blocking);

    debug!(
        stages = stages.len(),
        errors = errors.len(),
        warnings = warnings.len(),
        is_valid,
        "Pipeline graph validated"
    );

    ValidationReport {
        is_valid,
        errors,
        warnings,
        entry_stage_ids,
    }
}

/// Recompute entry stages and validation state of a configuration in place.
pub fn refresh_configuration(config: &mut PipelineConfiguration) -> ValidationReport {
    let report = validate_pipeline_graph(&config.stages);
    config.record_validation(
        report.entry_stage_ids.clone(),
        report.is_valid,
        report.error_messages(),
        report.warning_messages(),
    );
    report
}

/// Three-color DFS; every edge into a gray node closes a cycle.
///
/// Iterative so that long chains cannot overflow the stack. Returns each cycle
/// as the path segment from the re-entered node to the node closing it.
fn detect_cycles<'a>(
    order: &[&'a str],
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = order.iter().map(|id| (*id, Mark::White)).collect();
    let mut cycles = Vec::new();

    for &root in order {
        if marks.get(root) != Some(&Mark::White) {
            continue;
        }

        let mut path: Vec<&str> = vec![root];
        let mut cursor: Vec<usize> = vec![0];
        marks.insert(root, Mark::Gray);

        while let Some(&node) = path.last() {
            let next = {
                let Some(i) = cursor.last_mut() else { break };
                let child = adjacency
                    .get(node)
                    .and_then(|children| children.get(*i))
                    .copied();
                *i += 1;
                child
            };

            match next {
                Some(child) => match marks.get(child).copied().unwrap_or(Mark::Black) {
                    Mark::White => {
                        marks.insert(child, Mark::Gray);
                        path.push(child);
                        cursor.push(0);
                    }
                    Mark::Gray => {
                        let start = path.iter().position(|id| *id == child).unwrap_or(0);
                        cycles.push(path[start..].iter().map(|id| (*id).to_string()).collect());
                    }
                    Mark::Black => {}
                },
                None => {
                    marks.insert(node, Mark::Black);
                    path.pop();
                    cursor.pop();
                }
            }
        }
    }

    cycles
}

/// Breadth-first reachability from the entry set.
fn reachable_from<'a>(
    entries: &'a [String],
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
) -> HashSet<&'a str> {
    let mut reached: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();

    for id in entries {
        if reached.insert(id.as_str()) {
            queue.push_back(id.as_str());
        }
    }

    while let Some(node) = queue.pop_front() {
        if let Some(children) = adjacency.get(node) {
            for &child in children {
                if reached.insert(child) {
                    queue.push_back(child);
                }
            }
        }
    }

    reached
}
