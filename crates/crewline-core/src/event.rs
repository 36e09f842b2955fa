use crate::execution::StageStatus;

/// Pipeline event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// An editor session flushed its graph into a configuration.
    PipelineSynced {
        pipeline_id: String,
        is_valid: bool,
        error_count: usize,
    },
    /// A configuration became the active pipeline of a team.
    PipelineActivated { team_id: String, pipeline_id: String },
    /// A stage of a mission run changed status.
    StageTransitioned {
        mission_id: String,
        stage_id: String,
        from: StageStatus,
        to: StageStatus,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: PipelineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
