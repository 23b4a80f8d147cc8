//! Workflow document model and validation.
//!
//! A workflow is a declarative YAML document naming a set of tasks with
//! dependency edges by task name. Documents are validated before
//! anything is submitted: unknown keys, duplicate or malformed names,
//! ambiguous payloads, bad pin indices, and dependency cycles all fail
//! fast with `WorkflowInvalid`.

use crate::core::task::TaskPriority;
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a workflow instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

fn default_instances() -> usize {
    1
}

/// One task entry in a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    /// Unique name within the workflow; dependency edges use names.
    pub name: String,
    /// Prompt payload; mutually exclusive with `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Shell command payload; mutually exclusive with `prompt`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Working directory for a command payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// 1-based index pinning the task to one of the workflow's workers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<usize>,
    /// Names of tasks in this document that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Timeout in seconds; the configured default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
}

/// A declarative workflow: a named DAG of tasks over a requested number
/// of workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDocument {
    pub name: String,
    /// Number of workers the workflow would like available.
    #[serde(default = "default_instances")]
    pub instances: usize,
    pub tasks: Vec<TaskSpec>,
}

impl WorkflowDocument {
    /// Parse a YAML document and validate it.
    pub fn from_yaml(source: &str) -> Result<Self> {
        let doc: WorkflowDocument = serde_yaml::from_str(source)
            .map_err(|e| Error::WorkflowInvalid(format!("YAML: {}", e)))?;
        doc.validate()?;
        Ok(doc)
    }

    /// Validate the document without submitting anything.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::WorkflowInvalid("workflow name is empty".to_string()));
        }
        if self.instances == 0 {
            return Err(Error::WorkflowInvalid(
                "instances must be at least 1".to_string(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(Error::WorkflowInvalid("workflow has no tasks".to_string()));
        }

        let name_pattern =
            Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("valid name pattern");
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for task in &self.tasks {
            if !name_pattern.is_match(&task.name) {
                return Err(Error::WorkflowInvalid(format!(
                    "invalid task name: {:?}",
                    task.name
                )));
            }
            if seen.insert(task.name.as_str(), ()).is_some() {
                return Err(Error::WorkflowInvalid(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }

            match (&task.prompt, &task.command) {
                (Some(_), Some(_)) => {
                    return Err(Error::WorkflowInvalid(format!(
                        "task {} has both prompt and command",
                        task.name
                    )))
                }
                (None, None) => {
                    return Err(Error::WorkflowInvalid(format!(
                        "task {} has neither prompt nor command",
                        task.name
                    )))
                }
                _ => {}
            }
            if task.directory.is_some() && task.command.is_none() {
                return Err(Error::WorkflowInvalid(format!(
                    "task {} sets directory without a command",
                    task.name
                )));
            }
            if let Some(instance) = task.instance {
                if instance == 0 || instance > self.instances {
                    return Err(Error::WorkflowInvalid(format!(
                        "task {} pins instance {} outside 1..={}",
                        task.name, instance, self.instances
                    )));
                }
            }
            if task.timeout == Some(0) {
                return Err(Error::WorkflowInvalid(format!(
                    "task {} has a zero timeout",
                    task.name
                )));
            }
        }

        // Resolve dependency names and check the DAG for cycles.
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for task in &self.tasks {
            nodes.insert(task.name.as_str(), graph.add_node(task.name.as_str()));
        }
        for task in &self.tasks {
            for dep in &task.depends_on {
                let dep_node = nodes.get(dep.as_str()).ok_or_else(|| {
                    Error::WorkflowInvalid(format!(
                        "task {} depends on unknown task {}",
                        task.name, dep
                    ))
                })?;
                graph.add_edge(*dep_node, nodes[task.name.as_str()], ());
                if is_cyclic_directed(&graph) {
                    return Err(Error::WorkflowInvalid(format!(
                        "dependency cycle through {} -> {}",
                        dep, task.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // WorkflowId tests

    #[test]
    fn test_workflow_id_new_is_unique() {
        assert_ne!(WorkflowId::new(), WorkflowId::new());
    }

    #[test]
    fn test_workflow_id_short() {
        assert_eq!(WorkflowId::new().short().len(), 8);
    }

    #[test]
    fn test_workflow_id_roundtrip() {
        let id = WorkflowId::new();
        let parsed: WorkflowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    // Parsing tests

    const GOOD: &str = r#"
name: build-pipeline
instances: 2
tasks:
  - name: fetch
    command: git fetch
  - name: build
    command: make all
    directory: /srv/app
    depends_on: [fetch]
    timeout: 600
  - name: summarize
    prompt: Summarize the build log
    instance: 1
    depends_on: [build]
    priority: high
"#;

    #[test]
    fn test_parse_valid_document() {
        let doc = WorkflowDocument::from_yaml(GOOD).unwrap();
        assert_eq!(doc.name, "build-pipeline");
        assert_eq!(doc.instances, 2);
        assert_eq!(doc.tasks.len(), 3);
        assert_eq!(doc.tasks[1].depends_on, vec!["fetch".to_string()]);
        assert_eq!(doc.tasks[2].priority, Some(TaskPriority::High));
    }

    #[test]
    fn test_instances_defaults_to_one() {
        let doc =
            WorkflowDocument::from_yaml("name: w\ntasks:\n  - name: a\n    command: ls\n").unwrap();
        assert_eq!(doc.instances, 1);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let source = "name: w\nreplicas: 3\ntasks:\n  - name: a\n    command: ls\n";
        assert!(matches!(
            WorkflowDocument::from_yaml(source),
            Err(Error::WorkflowInvalid(_))
        ));
    }

    #[test]
    fn test_unknown_task_key_rejected() {
        let source = "name: w\ntasks:\n  - name: a\n    command: ls\n    retries: 3\n";
        assert!(matches!(
            WorkflowDocument::from_yaml(source),
            Err(Error::WorkflowInvalid(_))
        ));
    }

    // Validation tests

    fn spec(name: &str, command: &str) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            prompt: None,
            command: Some(command.to_string()),
            directory: None,
            instance: None,
            depends_on: Vec::new(),
            timeout: None,
            priority: None,
        }
    }

    fn doc(tasks: Vec<TaskSpec>) -> WorkflowDocument {
        WorkflowDocument {
            name: "test".to_string(),
            instances: 2,
            tasks,
        }
    }

    #[test]
    fn test_validate_empty_tasks() {
        assert!(doc(vec![]).validate().is_err());
    }

    #[test]
    fn test_validate_duplicate_names() {
        let d = doc(vec![spec("a", "ls"), spec("a", "pwd")]);
        let err = d.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_bad_name() {
        let d = doc(vec![spec("has spaces", "ls")]);
        assert!(d.validate().is_err());
    }

    #[test]
    fn test_validate_both_payloads() {
        let mut s = spec("a", "ls");
        s.prompt = Some("also a prompt".to_string());
        assert!(doc(vec![s]).validate().is_err());
    }

    #[test]
    fn test_validate_no_payload() {
        let mut s = spec("a", "ls");
        s.command = None;
        assert!(doc(vec![s]).validate().is_err());
    }

    #[test]
    fn test_validate_directory_requires_command() {
        let s = TaskSpec {
            name: "a".to_string(),
            prompt: Some("p".to_string()),
            command: None,
            directory: Some(PathBuf::from("/tmp")),
            instance: None,
            depends_on: Vec::new(),
            timeout: None,
            priority: None,
        };
        assert!(doc(vec![s]).validate().is_err());
    }

    #[test]
    fn test_validate_instance_bounds() {
        let mut s = spec("a", "ls");
        s.instance = Some(3);
        assert!(doc(vec![s.clone()]).validate().is_err());
        s.instance = Some(0);
        assert!(doc(vec![s.clone()]).validate().is_err());
        s.instance = Some(2);
        assert!(doc(vec![s]).validate().is_ok());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let mut s = spec("a", "ls");
        s.depends_on = vec!["ghost".to_string()];
        let err = doc(vec![s]).validate().unwrap_err();
        assert!(err.to_string().contains("unknown task"));
    }

    #[test]
    fn test_validate_self_dependency_is_cycle() {
        let mut s = spec("a", "ls");
        s.depends_on = vec!["a".to_string()];
        let err = doc(vec![s]).validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_two_node_cycle() {
        let mut a = spec("a", "ls");
        let mut b = spec("b", "pwd");
        a.depends_on = vec!["b".to_string()];
        b.depends_on = vec!["a".to_string()];
        let err = doc(vec![a, b]).validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_validate_diamond_is_acyclic() {
        let root = spec("root", "ls");
        let mut left = spec("left", "ls");
        let mut right = spec("right", "ls");
        let mut join = spec("join", "ls");
        left.depends_on = vec!["root".to_string()];
        right.depends_on = vec!["root".to_string()];
        join.depends_on = vec!["left".to_string(), "right".to_string()];
        assert!(doc(vec![root, left, right, join]).validate().is_ok());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut s = spec("a", "ls");
        s.timeout = Some(0);
        assert!(doc(vec![s]).validate().is_err());
    }

    #[test]
    fn test_validate_zero_instances() {
        let mut d = doc(vec![spec("a", "ls")]);
        d.instances = 0;
        assert!(d.validate().is_err());
    }
}
