use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crewline_core::config::AppConfig;
use crewline_core::event::EventBus;
use crewline_core::types::{PipelineConfiguration, PipelineDocument};
use crewline_pipeline::{
    auto_layout_graph, graph_to_stages, refresh_configuration, stages_to_graph, EventEnvelope,
    ExecutionEvent, ExecutionStateMachine, LayoutOptions, SqlitePipelineStore,
    TransitionOutcome,
};

#[derive(Parser)]
#[command(name = "crewline", version, about = "Team pipeline graph tooling")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "crewline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline file (exits non-zero on blocking errors)
    Validate {
        /// Pipeline JSON: a configuration or a bare stage array
        file: PathBuf,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the editor graph of a pipeline file
    Graph { file: PathBuf },
    /// Auto-layout a pipeline file and print it with positions
    Layout {
        file: PathBuf,
        /// Print the laid-out graph instead of the configuration
        #[arg(long)]
        graph: bool,
    },
    /// Replay execution events (JSON lines) against a pipeline
    Simulate {
        pipeline: PathBuf,
        events: PathBuf,
        /// Mission id (random if not provided)
        #[arg(long)]
        mission: Option<String>,
    },
    /// Start the HTTP gateway
    Serve,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("crewline=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "crewline", &mut std::io::stdout());
        return Ok(());
    }

    let config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Validate { file, json } => {
            let mut pipeline = read_pipeline(&file)?;
            let report = refresh_configuration(&mut pipeline);

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for issue in &report.errors {
                    println!("error: {}", issue);
                }
                for issue in &report.warnings {
                    println!("warning: {}", issue);
                }
                println!("entry stages: {}", report.entry_stage_ids.join(", "));
                if report.is_valid {
                    println!("{}: valid ({} stages)", pipeline.name, pipeline.stages.len());
                } else {
                    println!("{}: invalid ({} error(s))", pipeline.name, report.errors.len());
                }
            }

            if !report.is_valid {
                std::process::exit(1);
            }
        }
        Commands::Graph { file } => {
            let pipeline = read_pipeline(&file)?;
            let graph = stages_to_graph(&pipeline.stages, &config.agents);
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Layout { file, graph } => {
            let mut pipeline = read_pipeline(&file)?;
            let mut editor_graph = stages_to_graph(&pipeline.stages, &config.agents);
            editor_graph.nodes = auto_layout_graph(
                &editor_graph.nodes,
                &editor_graph.edges,
                &LayoutOptions::from(&config.layout),
            );

            if graph {
                println!("{}", serde_json::to_string_pretty(&editor_graph)?);
            } else {
                pipeline.stages = graph_to_stages(&editor_graph.nodes, &editor_graph.edges);
                refresh_configuration(&mut pipeline);
                println!("{}", serde_json::to_string_pretty(&pipeline)?);
            }
        }
        Commands::Simulate {
            pipeline,
            events,
            mission,
        } => {
            let mut pipeline = read_pipeline(&pipeline)?;
            let report = refresh_configuration(&mut pipeline);
            if !report.is_valid {
                warn!(errors = report.errors.len(), "Simulating an invalid pipeline");
            }
            let mission = mission.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            simulate(&pipeline, &mission, &events, &config)?;
        }
        Commands::Serve => {
            let store = Arc::new(SqlitePipelineStore::open(&config.store_path())?);
            let event_bus = Arc::new(EventBus::default());
            let agents = Arc::new(config.agents.clone());
            let state = crewline_gateway::AppState::new(&config, store, event_bus, agents);
            info!(bind = %state.config.bind, "Starting gateway");
            let server = crewline_gateway::GatewayServer::new(state);

            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => unreachable!("handled before config load"),
    }

    Ok(())
}

/// Read a pipeline file; a bare stage array is named after the file.
fn read_pipeline(path: &Path) -> anyhow::Result<PipelineConfiguration> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let doc: PipelineDocument = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a pipeline document", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pipeline".to_string());
    Ok(doc.into_configuration(&name))
}

/// Parse one JSON line as an envelope, or as a bare event.
fn parse_event_line(line: &str) -> anyhow::Result<EventEnvelope> {
    if let Ok(envelope) = serde_json::from_str::<EventEnvelope>(line) {
        return Ok(envelope);
    }
    let event: ExecutionEvent = serde_json::from_str(line)?;
    Ok(event.into())
}

fn simulate(
    pipeline: &PipelineConfiguration,
    mission: &str,
    events: &Path,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(events)
        .with_context(|| format!("Failed to read {}", events.display()))?;
    let mut machine = ExecutionStateMachine::new(pipeline, mission, &config.execution);

    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let envelope = match parse_event_line(line) {
            Ok(envelope) => envelope,
            Err(e) => {
                println!("line {}: unreadable event: {}", n + 1, e);
                continue;
            }
        };
        let stage_id = envelope.event.stage_id().to_string();
        match machine.apply(envelope) {
            Ok(TransitionOutcome::Applied { transitions }) if transitions.is_empty() => {
                println!("line {}: {} updated", n + 1, stage_id);
            }
            Ok(TransitionOutcome::Applied { transitions }) => {
                for t in transitions {
                    println!("line {}: {} {} -> {}", n + 1, t.stage_id, t.from, t.to);
                }
            }
            Ok(TransitionOutcome::NoOp { reason }) => {
                println!("line {}: {} unchanged ({})", n + 1, stage_id, reason);
            }
            Err(e) => println!("line {}: rejected: {}", n + 1, e),
        }
    }

    let active: Vec<String> = machine.active_agent_ids().into_iter().collect();
    println!(
        "total cost {:.2}; ready: [{}]; active agents: [{}]; finished: {}",
        machine.total_cost(),
        machine.ready_stages().join(", "),
        active.join(", "),
        machine.is_finished()
    );
    println!("{}", serde_json::to_string_pretty(machine.execution())?);
    Ok(())
}
