//! Workflow documents and the executor that expands them into tasks.

pub mod executor;
pub mod types;

pub use executor::{SubmittedWorkflow, TaskSummary, WorkflowExecutor, WorkflowOutcome};
pub use types::{TaskSpec, WorkflowDocument, WorkflowId};
