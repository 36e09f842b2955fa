//! Fixtures shared by the unit and integration tests of every crate.

use std::collections::HashMap;

use crewline_core::types::{AgentProfile, BranchType, JoinPolicy, PipelineConfiguration, Stage};

/// A stage named after its id with the given successors.
pub fn stage(id: &str, next: &[&str]) -> Stage {
    Stage::new(id, id.to_uppercase()).with_next(next.iter().copied())
}

/// A linear chain `ids[0] -> ids[1] -> ...`.
pub fn chain(ids: &[&str]) -> Vec<Stage> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| {
            let next: Vec<&str> = ids.get(i + 1).into_iter().copied().collect();
            stage(id, &next)
        })
        .collect()
}

/// `s1 -> s2`, `s2 -> {s3, s4}` (parallel fan-out).
pub fn fan_out_pipeline() -> Vec<Stage> {
    vec![
        stage("s1", &["s2"]).with_agents(["planner"]),
        stage("s2", &["s3", "s4"])
            .with_branch(BranchType::Parallel)
            .with_agents(["architect"]),
        stage("s3", &[]).with_agents(["coder"]),
        stage("s4", &[]).with_agents(["tester"]),
    ]
}

/// `triage` decides between `fix` and `docs` (optional), both feeding `ship`,
/// which joins on whichever branch ran.
pub fn conditional_pipeline() -> Vec<Stage> {
    vec![
        stage("triage", &["fix", "docs"]).with_branch(BranchType::Conditional),
        stage("fix", &["ship"]).optional(),
        stage("docs", &["ship"]).optional(),
        stage("ship", &[]).with_join(JoinPolicy::Any),
    ]
}

/// `a -> b -> c -> a`, plus an entry `start -> a`.
pub fn cyclic_pipeline() -> Vec<Stage> {
    vec![
        stage("start", &["a"]),
        stage("a", &["b"]),
        stage("b", &["c"]),
        stage("c", &["a"]),
    ]
}

/// Agents referenced by the fixtures above.
pub fn agent_directory() -> HashMap<String, AgentProfile> {
    [
        ("planner", "Planner", "🧭"),
        ("architect", "Architect", "📐"),
        ("coder", "Coder", "⌨️"),
        ("tester", "Tester", "🧪"),
    ]
    .into_iter()
    .map(|(id, name, emoji)| {
        let mut profile = AgentProfile::new(id, name);
        profile.emoji = emoji.to_string();
        (id.to_string(), profile)
    })
    .collect()
}

/// A configuration holding `stages`, not yet validated.
pub fn configuration(name: &str, stages: Vec<Stage>) -> PipelineConfiguration {
    PipelineConfiguration::new(name).with_stages(stages)
}

/// Serialize stages the way the pipeline store does.
pub fn stages_json(stages: &[Stage]) -> serde_json::Value {
    serde_json::to_value(stages).unwrap_or(serde_json::Value::Null)
}
