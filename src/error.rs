use thiserror::Error;

use crate::core::task::TaskId;
use crate::orchestration::worker::WorkerId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Pool capacity exceeded (max: {max})")]
    CapacityExceeded { max: usize },

    #[error("Worker failed to start: {reason}")]
    WorkerStartFailure { reason: String },

    #[error("Worker execution error: {0}")]
    WorkerExecution(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Adding dependency on {dep} to task {task} would create a cycle")]
    CycleDetected { task: TaskId, dep: TaskId },

    #[error("Invalid workflow: {0}")]
    WorkflowInvalid(String),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Worker not found: {0}")]
    UnknownWorker(WorkerId),

    #[error("Orchestrator is shutting down")]
    ShuttingDown,

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
