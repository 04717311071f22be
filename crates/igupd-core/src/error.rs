use thiserror::Error;

use crate::schedule::ScheduleError;

#[derive(Debug, Error)]
pub enum IgupdError {
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no usable update source: configure suricatta or an image")]
    NoUpdateSource,

    #[error("unknown boot side '{0}'")]
    UnknownBootSide(String),

    #[error("command '{command}' timed out after {secs}s")]
    CommandTimeout { command: String, secs: u64 },

    #[error("orchestrator is not running")]
    OrchestratorStopped,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, IgupdError>;
