pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod types;

pub use config::AppConfig;
pub use error::{CrewlineError, Result};
pub use event::{EventBus, PipelineEvent};
pub use execution::{
    LogEntry, LogLevel, PipelineExecution, PipelineStageExecution, StageLogs, StageStatus,
};
pub use types::*;
