//! Task data model for the execution engine.
//!
//! Tasks are the atomic units of work dispatched to workers. Each task
//! tracks its payload, priority, dependencies, pinning, timing, and result.

use crate::orchestration::worker::WorkerId;
use crate::workflow::WorkflowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Result error marker for a task cancelled by direct request.
pub const REASON_CANCELLED: &str = "cancelled";
/// Result error marker for a task cancelled because an ancestor failed.
pub const REASON_UPSTREAM_FAILED: &str = "upstream-failed";
/// Result error marker for a task whose worker was terminated mid-flight.
pub const REASON_WORKER_TERMINATED: &str = "worker-terminated";
/// Result error marker for a task that exceeded its timeout.
pub const REASON_TIMEOUT: &str = "timeout";
/// Result error marker for a worker child that exited during execution.
pub const REASON_PROCESS_EXITED: &str = "process-exited";

/// Unique identifier for a task.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Task priority levels, totally ordered with `Critical` highest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// All priorities from highest to lowest, in dispatch order.
    pub const DISPATCH_ORDER: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Index of this priority's ready lane.
    pub fn lane(&self) -> usize {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "normal" => Ok(TaskPriority::Normal),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

/// Task state in its lifecycle.
///
/// Transitions: `Pending -> Ready -> Running -> {Completed, Failed}`;
/// any non-terminal state may transition to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// At least one dependency is not yet terminal.
    #[default]
    Pending,
    /// All dependencies completed; awaiting a worker.
    Ready,
    /// Currently executing on exactly one worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskState {
    /// Check whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Pending => write!(f, "pending"),
            TaskState::Ready => write!(f, "ready"),
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "ready" => Ok(TaskState::Ready),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(format!("unknown task state: {}", other)),
        }
    }
}

/// What a task asks a worker to do: a model prompt or a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPayload {
    /// A prompt routed through the worker profile's prompt command.
    Prompt { prompt: String },
    /// A shell command, optionally executed in a specific directory.
    Command {
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_directory: Option<PathBuf>,
    },
}

impl TaskPayload {
    /// A short human label derived from the payload text.
    pub fn label(&self) -> String {
        let text = match self {
            TaskPayload::Prompt { prompt } => prompt,
            TaskPayload::Command { command, .. } => command,
        };
        let mut label: String = text.chars().take(50).collect();
        if text.chars().count() > 50 {
            label.push_str("...");
        }
        label
    }
}

/// Outcome of a task execution, immutable once the task is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Captured worker output.
    pub output: String,
    /// Exit code reported by the worker; non-zero on failure.
    pub exit_code: i32,
    /// Error marker when the task did not complete normally.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

impl TaskResult {
    /// A result carrying the worker's output and exit code.
    pub fn from_exit(output: String, exit_code: i32, duration: Duration) -> Self {
        let error = if exit_code == 0 {
            None
        } else {
            Some(format!("exit code {}", exit_code))
        };
        Self {
            output,
            exit_code,
            error,
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// A result for an execution that faulted before producing an exit code.
    pub fn faulted(reason: &str, output: String, duration: Duration) -> Self {
        Self {
            output,
            exit_code: -1,
            error: Some(reason.to_string()),
            duration_ms: duration.as_millis() as u64,
        }
    }

    /// A synthetic result for a task cancelled before it ran.
    pub fn cancelled(reason: &str) -> Self {
        Self {
            output: String::new(),
            exit_code: -1,
            error: Some(reason.to_string()),
            duration_ms: 0,
        }
    }

    /// Check whether the result represents a successful execution.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Parameters for submitting a single task.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Optional human label; derived from the payload when absent.
    pub name: Option<String>,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    /// Ids of tasks that must complete before this one may run.
    pub depends_on: Vec<TaskId>,
    /// Pin execution to a specific worker.
    pub pinned_worker: Option<WorkerId>,
    /// Execution timeout; the configured default applies when absent.
    pub timeout: Option<Duration>,
}

impl TaskRequest {
    /// A request wrapping a prompt payload with default settings.
    pub fn prompt(prompt: &str) -> Self {
        Self {
            name: None,
            payload: TaskPayload::Prompt {
                prompt: prompt.to_string(),
            },
            priority: TaskPriority::Normal,
            depends_on: Vec::new(),
            pinned_worker: None,
            timeout: None,
        }
    }

    /// A request wrapping a shell command with default settings.
    pub fn command(command: &str) -> Self {
        Self {
            name: None,
            payload: TaskPayload::Command {
                command: command.to_string(),
                working_directory: None,
            },
            priority: TaskPriority::Normal,
            depends_on: Vec::new(),
            pinned_worker: None,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }

    pub fn with_pinned(mut self, worker: WorkerId) -> Self {
        self.pinned_worker = Some(worker);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// A single task owned by the queue for its entire lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned on submission.
    pub id: TaskId,
    /// Human-readable label; unique within a workflow, otherwise free-form.
    pub name: String,
    pub payload: TaskPayload,
    pub priority: TaskPriority,
    /// Ids of tasks that must complete before this one may run.
    pub depends_on: Vec<TaskId>,
    /// Worker this task is constrained to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_worker: Option<WorkerId>,
    /// Execution timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub state: TaskState,
    /// Set when a cancellation was requested while the task was running.
    pub cancel_requested: bool,
    /// Workflow this task belongs to, if it was batch-submitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowId>,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Set exactly once, when the task reaches a terminal state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    /// Build a task from a submission request.
    pub fn from_request(request: TaskRequest, default_timeout: Duration) -> Self {
        let name = request
            .name
            .unwrap_or_else(|| request.payload.label());
        Self {
            id: TaskId::new(),
            name,
            payload: request.payload,
            priority: request.priority,
            depends_on: request.depends_on,
            pinned_worker: request.pinned_worker,
            timeout: request.timeout.unwrap_or(default_timeout),
            state: TaskState::Pending,
            cancel_requested: false,
            workflow: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Replace the generated id, used by workflows that pre-assign ids
    /// while resolving dependency names.
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Tag the task with its owning workflow.
    pub fn with_workflow(mut self, workflow: WorkflowId) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Serialize a `Duration` as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}
