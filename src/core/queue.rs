//! Priority task queue with dependency gating.
//!
//! The queue owns every task for its entire lifetime. Ready tasks sit in
//! four FIFO lanes (one per priority); tasks with unmet dependencies wait
//! in a pending set and are promoted through a reverse-dependency index
//! when their ancestors complete. A failed or cancelled ancestor cascades
//! cancellation to all transitive dependents.
//!
//! The queue performs no locking itself; the orchestrator wraps it in an
//! `Arc<RwLock<_>>` and never holds the lock across a worker execution.

use crate::core::task::{
    Task, TaskId, TaskPriority, TaskResult, TaskState, REASON_CANCELLED, REASON_UPSTREAM_FAILED,
};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Side effects of a completion, reported so the caller can emit events.
#[derive(Debug, Default, Clone)]
pub struct CompletionEffects {
    /// Final state the task settled in.
    pub state: TaskState,
    /// Tasks promoted from pending to ready.
    pub promoted: Vec<TaskId>,
    /// Dependents cancelled because this task failed or was cancelled.
    pub cascade_cancelled: Vec<TaskId>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was already terminal; nothing changed.
    AlreadyTerminal,
    /// The task was cancelled immediately, cascading to the listed dependents.
    Cancelled { cascaded: Vec<TaskId> },
    /// The task is running; interruption is now the dispatcher's job.
    Requested,
}

/// Outcome of pushing a task back after a failed worker acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequeueOutcome {
    /// The task is back at the front of its priority lane.
    Requeued,
    /// A cancel arrived while the task was between queue and worker.
    Cancelled { cascaded: Vec<TaskId> },
    /// The task is no longer known.
    Missing,
}

/// Aggregate view of the queue, safe to serialize for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub total: usize,
    pub by_state: BTreeMap<String, usize>,
    /// Number of tasks sitting in the ready lanes.
    pub queue_depth: usize,
}

/// Priority queue with dependency resolution.
pub struct TaskQueue {
    /// Source of truth for every task and its state.
    tasks: HashMap<TaskId, Task>,
    /// FIFO ready lanes indexed by `TaskPriority::lane()`.
    lanes: [VecDeque<TaskId>; 4],
    /// Tasks waiting on unmet dependencies.
    pending: HashSet<TaskId>,
    /// Reverse-dependency index: task id -> tasks that depend on it.
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            lanes: Default::default(),
            pending: HashSet::new(),
            dependents: HashMap::new(),
        }
    }

    /// Add a single task.
    ///
    /// Dependencies must reference tasks already in the queue. A task that
    /// names itself as a dependency is rejected with `CycleDetected`; a
    /// dependency on an unknown id is rejected with `UnknownTask`. Either
    /// rejection leaves the queue unchanged.
    ///
    /// Returns the state the task was admitted in: `Ready` when all
    /// dependencies are already completed, `Pending` while some are not,
    /// or `Cancelled` when an ancestor has already failed.
    pub fn add(&mut self, task: Task) -> Result<TaskState> {
        for dep in &task.depends_on {
            if *dep == task.id {
                return Err(Error::CycleDetected {
                    task: task.id,
                    dep: *dep,
                });
            }
            if !self.tasks.contains_key(dep) {
                return Err(Error::UnknownTask(*dep));
            }
        }
        Ok(self.admit(task))
    }

    /// Add a batch of tasks atomically: either every task is admitted or
    /// none is.
    ///
    /// Batch tasks may depend on each other (by pre-assigned id) or on
    /// tasks already in the queue. The prospective dependency edges are
    /// checked for cycles before any mutation.
    pub fn add_batch(&mut self, batch: Vec<Task>) -> Result<Vec<(TaskId, TaskState)>> {
        let batch_ids: HashSet<TaskId> = batch.iter().map(|t| t.id).collect();

        for task in &batch {
            for dep in &task.depends_on {
                if !batch_ids.contains(dep) && !self.tasks.contains_key(dep) {
                    return Err(Error::UnknownTask(*dep));
                }
            }
        }

        // Existing tasks cannot depend on batch tasks, so a cycle can only
        // run through the batch itself. Add the intra-batch edges one at a
        // time and reject on the first edge that closes a loop.
        let mut graph: DiGraph<TaskId, ()> = DiGraph::new();
        let mut nodes = HashMap::new();
        for task in &batch {
            nodes.insert(task.id, graph.add_node(task.id));
        }
        for task in &batch {
            for dep in &task.depends_on {
                if let Some(&dep_node) = nodes.get(dep) {
                    graph.add_edge(dep_node, nodes[&task.id], ());
                    if is_cyclic_directed(&graph) {
                        return Err(Error::CycleDetected {
                            task: task.id,
                            dep: *dep,
                        });
                    }
                }
            }
        }

        // Insert every task as pending first so intra-batch dependency
        // lookups resolve, then classify each one.
        for task in &batch {
            let mut staged = task.clone();
            staged.state = TaskState::Pending;
            for dep in &staged.depends_on {
                self.dependents.entry(*dep).or_default().insert(staged.id);
            }
            self.pending.insert(staged.id);
            self.tasks.insert(staged.id, staged);
        }

        let mut admitted = Vec::with_capacity(batch.len());
        for task in &batch {
            let state = self.classify(task.id);
            admitted.push((task.id, state));
        }
        Ok(admitted)
    }

    /// Register an already-validated task and classify it.
    fn admit(&mut self, mut task: Task) -> TaskState {
        let id = task.id;
        task.state = TaskState::Pending;
        for dep in &task.depends_on {
            self.dependents.entry(*dep).or_default().insert(id);
        }
        self.pending.insert(id);
        self.tasks.insert(id, task);
        self.classify(id)
    }

    /// Move a pending task to ready or cancelled according to the current
    /// state of its dependencies. Returns the resulting state.
    fn classify(&mut self, id: TaskId) -> TaskState {
        let (blocked, failed_upstream) = {
            let task = match self.tasks.get(&id) {
                Some(t) => t,
                None => return TaskState::Cancelled,
            };
            if task.state != TaskState::Pending {
                return task.state;
            }
            let mut blocked = false;
            let mut failed_upstream = false;
            for dep in &task.depends_on {
                match self.tasks.get(dep).map(|t| t.state) {
                    Some(TaskState::Completed) => {}
                    Some(TaskState::Failed) | Some(TaskState::Cancelled) => {
                        failed_upstream = true
                    }
                    _ => blocked = true,
                }
            }
            (blocked, failed_upstream)
        };

        if failed_upstream {
            self.mark_cancelled(id, REASON_UPSTREAM_FAILED);
            TaskState::Cancelled
        } else if blocked {
            TaskState::Pending
        } else {
            self.promote(id);
            TaskState::Ready
        }
    }

    /// Promote a pending task into its ready lane.
    fn promote(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Ready;
            self.pending.remove(&id);
            self.lanes[task.priority.lane()].push_back(id);
        }
    }

    /// Pop the head of the highest non-empty priority lane and mark it
    /// running. Non-blocking.
    pub fn next_ready(&mut self) -> Option<Task> {
        for priority in TaskPriority::DISPATCH_ORDER {
            let lane = &mut self.lanes[priority.lane()];
            while let Some(id) = lane.pop_front() {
                // Entries for tasks that left the ready state are stale.
                let task = match self.tasks.get_mut(&id) {
                    Some(t) if t.state == TaskState::Ready => t,
                    _ => continue,
                };
                task.state = TaskState::Running;
                task.started_at = Some(chrono::Utc::now());
                return Some(task.clone());
            }
        }
        None
    }

    /// Push a running task back to the front of its lane, preserving FIFO
    /// order within the priority. Used when no worker could be acquired.
    pub fn requeue_front(&mut self, id: TaskId) -> RequeueOutcome {
        let (cancel_requested, lane) = match self.tasks.get(&id) {
            Some(task) if task.state == TaskState::Running => {
                (task.cancel_requested, task.priority.lane())
            }
            _ => return RequeueOutcome::Missing,
        };

        if cancel_requested {
            let cascaded = self.mark_cancelled(id, REASON_CANCELLED);
            return RequeueOutcome::Cancelled { cascaded };
        }

        if let Some(task) = self.tasks.get_mut(&id) {
            task.state = TaskState::Ready;
            task.started_at = None;
        }
        self.lanes[lane].push_front(id);
        RequeueOutcome::Requeued
    }

    /// Record the result of a finished execution.
    ///
    /// The terminal state is derived from the result: an explicit
    /// `"cancelled"` error marks the task cancelled, exit code zero marks
    /// it completed, anything else marks it failed. Completion promotes
    /// dependents whose last unmet dependency this was; failure and
    /// cancellation cascade-cancel all transitive dependents.
    ///
    /// Completing an already-terminal task is a no-op: results are
    /// immutable once written.
    pub fn complete(&mut self, id: TaskId, result: TaskResult) -> Result<CompletionEffects> {
        let task = self.tasks.get_mut(&id).ok_or(Error::UnknownTask(id))?;
        if task.is_terminal() {
            return Ok(CompletionEffects {
                state: task.state,
                ..Default::default()
            });
        }

        let state = if result.error.as_deref() == Some(REASON_CANCELLED)
            || (task.cancel_requested && !result.is_success())
        {
            TaskState::Cancelled
        } else if result.is_success() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };

        task.state = state;
        task.completed_at = Some(chrono::Utc::now());
        task.result = Some(result);
        self.pending.remove(&id);

        let mut effects = CompletionEffects {
            state,
            ..Default::default()
        };
        match state {
            TaskState::Completed => effects.promoted = self.promote_dependents(id),
            _ => effects.cascade_cancelled = self.cascade_cancel(id),
        }
        Ok(effects)
    }

    /// Cancel a task.
    ///
    /// Terminal tasks are left untouched. Pending and ready tasks are
    /// cancelled immediately, cascading to dependents. For a running task
    /// only the request flag is set; the dispatcher owning the worker is
    /// responsible for interrupting the execution.
    pub fn cancel(&mut self, id: TaskId) -> Result<CancelOutcome> {
        let state = self.tasks.get(&id).ok_or(Error::UnknownTask(id))?.state;
        match state {
            s if s.is_terminal() => Ok(CancelOutcome::AlreadyTerminal),
            TaskState::Running => {
                if let Some(task) = self.tasks.get_mut(&id) {
                    task.cancel_requested = true;
                }
                Ok(CancelOutcome::Requested)
            }
            _ => {
                let cascaded = self.mark_cancelled(id, REASON_CANCELLED);
                Ok(CancelOutcome::Cancelled { cascaded })
            }
        }
    }

    /// Cancel a task in place with the given reason and cascade to its
    /// dependents. Returns the ids of cascaded dependents (excluding `id`).
    fn mark_cancelled(&mut self, id: TaskId, reason: &str) -> Vec<TaskId> {
        if let Some(task) = self.tasks.get_mut(&id) {
            if task.is_terminal() {
                return Vec::new();
            }
            task.state = TaskState::Cancelled;
            task.completed_at = Some(chrono::Utc::now());
            task.result = Some(TaskResult::cancelled(reason));
        } else {
            return Vec::new();
        }
        self.pending.remove(&id);
        for lane in self.lanes.iter_mut() {
            lane.retain(|queued| *queued != id);
        }
        self.cascade_cancel(id)
    }

    /// Cancel every non-terminal transitive dependent of `id` with reason
    /// `"upstream-failed"`. Returns the cancelled ids in cascade order.
    fn cascade_cancel(&mut self, id: TaskId) -> Vec<TaskId> {
        let mut cancelled = Vec::new();
        let mut stack: Vec<TaskId> = self
            .dependents
            .get(&id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();

        while let Some(next) = stack.pop() {
            let task = match self.tasks.get_mut(&next) {
                Some(t) if !t.is_terminal() => t,
                _ => continue,
            };
            task.state = TaskState::Cancelled;
            task.completed_at = Some(chrono::Utc::now());
            task.result = Some(TaskResult::cancelled(REASON_UPSTREAM_FAILED));
            self.pending.remove(&next);
            for lane in self.lanes.iter_mut() {
                lane.retain(|queued| *queued != next);
            }
            cancelled.push(next);
            if let Some(further) = self.dependents.get(&next) {
                stack.extend(further.iter().copied());
            }
        }
        cancelled
    }

    /// Promote every dependent of `id` whose dependencies are now all
    /// completed. Returns the promoted ids.
    fn promote_dependents(&mut self, id: TaskId) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = self
            .dependents
            .get(&id)
            .map(|deps| deps.iter().copied().collect())
            .unwrap_or_default();

        let mut promoted = Vec::new();
        for candidate in candidates {
            let satisfied = {
                let task = match self.tasks.get(&candidate) {
                    Some(t) if t.state == TaskState::Pending => t,
                    _ => continue,
                };
                task.depends_on.iter().all(|dep| {
                    self.tasks
                        .get(dep)
                        .map(|t| t.state == TaskState::Completed)
                        .unwrap_or(false)
                })
            };
            if satisfied {
                self.promote(candidate);
                promoted.push(candidate);
            }
        }
        promoted
    }

    /// Look up a task by id.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// List tasks, optionally filtered by state, newest first.
    pub fn list(&self, state: Option<TaskState>, limit: usize) -> Vec<Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|t| state.map(|s| t.state == s).unwrap_or(true))
            .collect();
        tasks.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        tasks.into_iter().take(limit).cloned().collect()
    }

    /// Check whether every listed task has reached a terminal state.
    /// Unknown ids (already cleared) count as terminal.
    pub fn all_terminal(&self, ids: &[TaskId]) -> bool {
        ids.iter()
            .all(|id| self.tasks.get(id).map(|t| t.is_terminal()).unwrap_or(true))
    }

    /// Drop terminal tasks from the table, returning how many were removed.
    pub fn clear_completed(&mut self) -> usize {
        let doomed: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            self.tasks.remove(id);
            self.dependents.remove(id);
        }
        for dependents in self.dependents.values_mut() {
            dependents.retain(|id| !doomed.contains(id));
        }
        doomed.len()
    }

    /// A consistent aggregate view of the queue.
    pub fn snapshot(&self) -> QueueSnapshot {
        let mut by_state = BTreeMap::new();
        for task in self.tasks.values() {
            *by_state.entry(task.state.to_string()).or_insert(0) += 1;
        }
        QueueSnapshot {
            total: self.tasks.len(),
            by_state,
            queue_depth: self.lanes.iter().map(|l| l.len()).sum(),
        }
    }

    /// Number of tasks in the queue, any state.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the queue holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("tasks", &self.tasks.len())
            .field("pending", &self.pending.len())
            .field(
                "ready",
                &self.lanes.iter().map(|l| l.len()).sum::<usize>(),
            )
            .finish()
    }
}
