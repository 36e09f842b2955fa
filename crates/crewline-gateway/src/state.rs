use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crewline_core::config::{AppConfig, EditorConfig, ExecutionConfig, GatewayConfig};
use crewline_core::event::EventBus;
use crewline_core::types::AgentDirectory;
use crewline_pipeline::{EditorSession, ExecutionStateMachine, LayoutOptions, SqlitePipelineStore};

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<SqlitePipelineStore>,
    pub event_bus: Arc<EventBus>,
    pub agents: Arc<dyn AgentDirectory>,
    pub layout: LayoutOptions,
    pub editor: EditorConfig,
    pub execution: ExecutionConfig,
    /// Live state machines of unfinished missions; missing ones are resumed from the store.
    pub missions: Mutex<HashMap<String, ExecutionStateMachine>>,
    /// Open editor sessions by pipeline id.
    pub editors: Mutex<HashMap<String, Arc<EditorSession>>>,
    /// Parent of every editor session's debounce loop.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        store: Arc<SqlitePipelineStore>,
        event_bus: Arc<EventBus>,
        agents: Arc<dyn AgentDirectory>,
    ) -> Self {
        Self {
            config: config.gateway.clone().unwrap_or_default(),
            store,
            event_bus,
            agents,
            layout: LayoutOptions::from(&config.layout),
            editor: config.editor.clone(),
            execution: config.execution.clone(),
            missions: Mutex::new(HashMap::new()),
            editors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }
}
