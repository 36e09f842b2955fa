use std::collections::HashSet;

use crewline_core::types::Stage;

/// Ids of stages that no stage (itself included) points to, in list order.
///
/// A stage that lists itself in `next_stage_ids` has an incoming edge and is
/// therefore not an entry.
pub fn find_entry_stages(stages: &[Stage]) -> Vec<String> {
    let targets: HashSet<&str> = stages
        .iter()
        .flat_map(|s| s.next_stage_ids.iter().map(String::as_str))
        .collect();

    let mut seen = HashSet::new();
    stages
        .iter()
        .filter(|s| !targets.contains(s.id.as_str()))
        .filter(|s| seen.insert(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

/// Ids of stages with no outgoing edge, in list order.
pub fn find_exit_stages(stages: &[Stage]) -> Vec<String> {
    let mut seen = HashSet::new();
    stages
        .iter()
        .filter(|s| s.is_exit())
        .filter(|s| seen.insert(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}
