//! The orchestrator: dispatch loops binding the task queue to the pool.
//!
//! `W` cooperative dispatcher loops pull ready tasks, acquire idle
//! workers (respecting pinning), run the task, and feed results back to
//! the queue, which unblocks dependents. A periodic health sweep reaps
//! dead workers. All state changes are published on the event bus.
//!
//! Locking discipline: the queue and pool each sit behind one `RwLock`,
//! and no dispatcher ever holds either lock across a worker execution.
//! The only long suspension point is the execute itself, guarded solely
//! by the worker's own process mutex.

use crate::config::Config;
use crate::core::queue::{CancelOutcome, CompletionEffects, RequeueOutcome, TaskQueue};
use crate::core::task::{
    Task, TaskId, TaskRequest, TaskResult, TaskState, REASON_CANCELLED, REASON_UPSTREAM_FAILED,
    REASON_WORKER_TERMINATED,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::orchestration::pool::{InstancePool, PoolStats, WorkerInfo};
use crate::orchestration::worker::{ExecOutcome, WorkerId, WorkerState};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fallback wake-up period for dispatchers waiting on a signal.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

/// Polling fallback while awaiting a batch of tasks.
const WAIT_POLL: Duration = Duration::from_millis(200);

/// Aggregate view served by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub instances: PoolStats,
    pub tasks: BTreeMap<String, usize>,
    pub total_tasks: usize,
    pub queue_depth: usize,
}

/// Coordinates the pool and the queue; owns both exclusively.
pub struct Orchestrator {
    config: Config,
    queue: Arc<RwLock<TaskQueue>>,
    pool: Arc<RwLock<InstancePool>>,
    events: EventBus,
    /// Cancellation tokens for tasks currently held by a dispatcher.
    running: RwLock<HashMap<TaskId, CancellationToken>>,
    /// Signalled when a task enters the ready lanes.
    work_signal: Notify,
    /// Signalled when a worker returns to the idle set.
    worker_signal: Notify,
    shutdown: CancellationToken,
    accepting: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build an orchestrator from configuration. Call `start` to spawn
    /// the initial workers and dispatcher loops.
    pub fn new(config: Config) -> Arc<Self> {
        let events = EventBus::new(config.event_buffer);
        let pool = InstancePool::new(config.pool_settings(), events.clone());
        Arc::new(Self {
            config,
            queue: Arc::new(RwLock::new(TaskQueue::new())),
            pool: Arc::new(RwLock::new(pool)),
            events,
            running: RwLock::new(HashMap::new()),
            work_signal: Notify::new(),
            worker_signal: Notify::new(),
            shutdown: CancellationToken::new(),
            accepting: AtomicBool::new(true),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// A handle for publishing and subscribing to orchestrator events.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// The configured default task timeout.
    pub fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Spawn the initial workers, the dispatcher loops, and the health
    /// sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let initial = self
            .config
            .initial_instances
            .min(self.config.max_instances);
        if initial > 0 {
            self.pool.write().await.spawn(initial, None).await?;
        }

        let dispatchers = self.config.dispatcher_count();
        let mut handles = self.handles.lock().await;
        for index in 0..dispatchers {
            let this = Arc::clone(self);
            handles.push(tokio::spawn(this.dispatch_loop(index)));
        }

        let this = Arc::clone(self);
        handles.push(tokio::spawn(this.sweep_loop()));

        info!(
            workers = initial,
            dispatchers,
            max_instances = self.config.max_instances,
            "orchestrator started"
        );
        Ok(())
    }

    /// Stop accepting submissions, drain the dispatchers (each finishes
    /// its current task and picks no new one), then terminate the pool.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        info!("orchestrator shutting down");
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.work_signal.notify_waiters();
        self.worker_signal.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.write().await.terminate_all().await;
        info!("orchestrator stopped");
    }

    // ---- Submission ----

    /// Submit one task; returns its assigned id.
    pub async fn submit(&self, request: TaskRequest) -> Result<TaskId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let task = Task::from_request(request, self.config.default_timeout());
        let ids = self.submit_tasks(vec![task]).await?;
        Ok(ids[0])
    }

    /// Submit a batch of requests; atomic at the queue boundary.
    pub async fn submit_batch(&self, requests: Vec<TaskRequest>) -> Result<Vec<TaskId>> {
        let tasks = requests
            .into_iter()
            .map(|r| Task::from_request(r, self.config.default_timeout()))
            .collect();
        self.submit_tasks(tasks).await
    }

    /// Submit pre-built tasks (ids already assigned). Used directly by
    /// the workflow executor, which resolves dependency names to ids
    /// before submission.
    pub async fn submit_tasks(&self, tasks: Vec<Task>) -> Result<Vec<TaskId>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let names: HashMap<TaskId, String> =
            tasks.iter().map(|t| (t.id, t.name.clone())).collect();

        let admitted = self.queue.write().await.add_batch(tasks)?;

        for (id, state) in &admitted {
            self.events.publish(Event::TaskSubmitted {
                task_id: *id,
                name: names.get(id).cloned().unwrap_or_default(),
            });
            match state {
                TaskState::Ready => {
                    self.events.publish(Event::TaskReady { task_id: *id });
                    self.work_signal.notify_one();
                }
                TaskState::Cancelled => {
                    self.events.publish(Event::TaskCancelled {
                        task_id: *id,
                        reason: REASON_UPSTREAM_FAILED.to_string(),
                    });
                }
                _ => {}
            }
        }
        Ok(admitted.into_iter().map(|(id, _)| id).collect())
    }

    // ---- Task operations ----

    /// Cancel a task. Returns false when the task was already terminal.
    pub async fn cancel(&self, id: TaskId) -> Result<bool> {
        let outcome = self.queue.write().await.cancel(id)?;
        match outcome {
            CancelOutcome::AlreadyTerminal => Ok(false),
            CancelOutcome::Cancelled { cascaded } => {
                self.events.publish(Event::TaskCancelled {
                    task_id: id,
                    reason: REASON_CANCELLED.to_string(),
                });
                for dependent in cascaded {
                    self.events.publish(Event::TaskCancelled {
                        task_id: dependent,
                        reason: REASON_UPSTREAM_FAILED.to_string(),
                    });
                }
                Ok(true)
            }
            CancelOutcome::Requested => {
                if let Some(token) = self.running.read().await.get(&id) {
                    token.cancel();
                }
                Ok(true)
            }
        }
    }

    /// Look up one task.
    pub async fn task(&self, id: TaskId) -> Result<Task> {
        self.queue
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownTask(id))
    }

    /// List tasks, optionally filtered by state, newest first.
    pub async fn tasks(&self, state: Option<TaskState>, limit: usize) -> Vec<Task> {
        self.queue.read().await.list(state, limit)
    }

    /// Drop terminal tasks from the table; returns how many were removed.
    pub async fn clear_completed(&self) -> usize {
        self.queue.write().await.clear_completed()
    }

    /// Block until every listed task is terminal.
    pub async fn wait_for(&self, ids: &[TaskId]) {
        let mut stream = self.events.subscribe();
        loop {
            if self.queue.read().await.all_terminal(ids) {
                return;
            }
            tokio::select! {
                _ = stream.recv() => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }

    // ---- Pool operations ----

    /// Grow the pool by `count` workers.
    pub async fn spawn_instances(
        &self,
        count: usize,
        working_directory: Option<std::path::PathBuf>,
    ) -> Result<Vec<WorkerId>> {
        let ids = self.pool.write().await.spawn(count, working_directory).await?;
        if !ids.is_empty() {
            self.worker_signal.notify_waiters();
        }
        Ok(ids)
    }

    /// Terminate a specific worker.
    pub async fn terminate_instance(&self, id: WorkerId) -> Result<()> {
        self.pool.write().await.terminate(id).await
    }

    /// Scale the pool toward `target`; returns the achieved count.
    pub async fn scale(&self, target: usize) -> usize {
        let current = self.pool.write().await.scale_to(target).await;
        self.worker_signal.notify_waiters();
        current
    }

    /// All workers in ascending id order.
    pub async fn instances(&self) -> Vec<WorkerInfo> {
        self.pool.read().await.list()
    }

    /// One worker's view.
    pub async fn instance(&self, id: WorkerId) -> Result<WorkerInfo> {
        self.pool.read().await.get(id).ok_or(Error::UnknownWorker(id))
    }

    /// Recent output lines from a worker's ring buffer.
    pub async fn instance_output(&self, id: WorkerId, lines: usize) -> Result<Vec<String>> {
        self.pool.read().await.recent_output(id, lines)
    }

    /// Idle, non-draining workers in ascending id order.
    pub async fn idle_workers(&self) -> Vec<WorkerId> {
        self.pool.read().await.idle_workers()
    }

    /// Aggregate status for `/status` and the WebSocket snapshot.
    pub async fn status(&self) -> StatusReport {
        let instances = self.pool.read().await.stats();
        let snapshot = self.queue.read().await.snapshot();
        StatusReport {
            instances,
            tasks: snapshot.by_state,
            total_tasks: snapshot.total,
            queue_depth: snapshot.queue_depth,
        }
    }

    // ---- Loops ----

    /// One cooperative dispatcher: pull a ready task, acquire a worker,
    /// execute, record, repeat.
    async fn dispatch_loop(self: Arc<Self>, index: usize) {
        debug!(dispatcher = index, "dispatcher started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let task = self.queue.write().await.next_ready();
            let Some(task) = task else {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.work_signal.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL) => {}
                }
                continue;
            };

            let lease = self
                .pool
                .write()
                .await
                .acquire(task.id, task.pinned_worker);
            let Some(lease) = lease else {
                // No worker free: hand the task back to the front of its
                // lane so FIFO order within the priority is preserved.
                if let RequeueOutcome::Cancelled { cascaded } =
                    self.queue.write().await.requeue_front(task.id)
                {
                    self.events.publish(Event::TaskCancelled {
                        task_id: task.id,
                        reason: REASON_CANCELLED.to_string(),
                    });
                    for dependent in cascaded {
                        self.events.publish(Event::TaskCancelled {
                            task_id: dependent,
                            reason: REASON_UPSTREAM_FAILED.to_string(),
                        });
                    }
                }
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.worker_signal.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL) => {}
                }
                continue;
            };

            self.events.publish(Event::TaskStarted {
                task_id: task.id,
                worker_id: lease.id,
            });
            debug!(task = %task.id.short(), worker = %lease.id, "task dispatched");

            // Register the interruption token, then re-check for a cancel
            // that raced with the queue-to-worker handoff.
            let token = CancellationToken::new();
            self.running.write().await.insert(task.id, token.clone());
            let already_cancelled = self
                .queue
                .read()
                .await
                .get(&task.id)
                .map(|t| t.cancel_requested)
                .unwrap_or(false);
            if already_cancelled {
                token.cancel();
            }

            let started = Instant::now();
            let mut proc = lease.proc.lock().await;
            let exec = {
                let fut = proc.execute(&task.payload, task.timeout);
                tokio::pin!(fut);
                tokio::select! {
                    outcome = &mut fut => Ok(outcome),
                    _ = token.cancelled() => Err(REASON_CANCELLED),
                    _ = lease.cancel.cancelled() => Err(REASON_WORKER_TERMINATED),
                }
            };
            let (outcome, release_state) = match exec {
                Ok(outcome) => {
                    let next = if outcome.worker_alive {
                        WorkerState::Idle
                    } else {
                        WorkerState::Unhealthy
                    };
                    (outcome, next)
                }
                Err(reason) => {
                    // Interrupted: the worker is disposable once stopped.
                    proc.stop(self.config.stop_grace()).await;
                    let outcome = ExecOutcome {
                        result: TaskResult::faulted(reason, String::new(), started.elapsed()),
                        worker_alive: false,
                    };
                    (outcome, WorkerState::Terminated)
                }
            };
            drop(proc);

            self.pool
                .write()
                .await
                .release(lease.id, release_state, outcome.result.is_success());
            self.worker_signal.notify_one();

            self.running.write().await.remove(&task.id);
            match self
                .queue
                .write()
                .await
                .complete(task.id, outcome.result.clone())
            {
                Ok(effects) => self.publish_completion(task.id, &effects, &outcome.result),
                Err(e) => warn!(task = %task.id, error = %e, "completion bookkeeping failed"),
            }
        }
        debug!(dispatcher = index, "dispatcher stopped");
    }

    /// Emit the terminal event for a task plus the ripple effects of its
    /// completion, and wake dispatchers for newly ready work.
    fn publish_completion(&self, id: TaskId, effects: &CompletionEffects, result: &TaskResult) {
        match effects.state {
            TaskState::Completed => self.events.publish(Event::TaskCompleted {
                task_id: id,
                exit_code: result.exit_code,
            }),
            TaskState::Failed => self.events.publish(Event::TaskFailed {
                task_id: id,
                error: result.error.clone().unwrap_or_default(),
            }),
            TaskState::Cancelled => self.events.publish(Event::TaskCancelled {
                task_id: id,
                reason: result
                    .error
                    .clone()
                    .unwrap_or_else(|| REASON_CANCELLED.to_string()),
            }),
            _ => {}
        }
        for promoted in &effects.promoted {
            self.events.publish(Event::TaskReady { task_id: *promoted });
            self.work_signal.notify_one();
        }
        for cancelled in &effects.cascade_cancelled {
            self.events.publish(Event::TaskCancelled {
                task_id: *cancelled,
                reason: REASON_UPSTREAM_FAILED.to_string(),
            });
        }
    }

    /// Periodic health sweep over the pool.
    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.health_sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            let (_, respawned) = self.pool.write().await.health_sweep().await;
            if respawned > 0 {
                // Replacements may have freed capacity for waiting tasks.
                self.worker_signal.notify_waiters();
            }
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskPriority;

    fn test_config(max_instances: usize, initial: usize) -> Config {
        Config {
            max_instances,
            initial_instances: initial,
            startup_grace_ms: 50,
            stop_grace_ms: 100,
            health_sweep_secs: 1,
            ..Config::default()
        }
    }

    async fn started(max_instances: usize, initial: usize) -> Arc<Orchestrator> {
        let orchestrator = Orchestrator::new(test_config(max_instances, initial));
        orchestrator.start().await.unwrap();
        orchestrator
    }

    #[tokio::test]
    async fn test_submit_and_complete() {
        let orchestrator = started(2, 1).await;
        let id = orchestrator
            .submit(TaskRequest::command("echo done"))
            .await
            .unwrap();
        orchestrator.wait_for(&[id]).await;

        let task = orchestrator.task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Completed);
        let result = task.result.unwrap();
        assert_eq!(result.output.trim(), "done");
        assert_eq!(result.exit_code, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_command_marks_task_failed() {
        let orchestrator = started(2, 1).await;
        let id = orchestrator
            .submit(TaskRequest::command("exit 7"))
            .await
            .unwrap();
        orchestrator.wait_for(&[id]).await;

        let task = orchestrator.task(id).await.unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.result.unwrap().exit_code, 7);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let orchestrator = started(2, 1).await;
        // Park the only worker on a long task so the second stays queued.
        let blocker = orchestrator
            .submit(TaskRequest::command("sleep 10"))
            .await
            .unwrap();
        let queued = orchestrator
            .submit(TaskRequest::command("echo never"))
            .await
            .unwrap();

        // Give the dispatcher a moment to start the blocker.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(orchestrator.cancel(queued).await.unwrap());
        orchestrator.wait_for(&[queued]).await;
        let task = orchestrator.task(queued).await.unwrap();
        assert_eq!(task.state, TaskState::Cancelled);

        assert!(orchestrator.cancel(blocker).await.unwrap());
        orchestrator.wait_for(&[blocker]).await;
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_terminal_task_is_noop() {
        let orchestrator = started(2, 1).await;
        let id = orchestrator
            .submit(TaskRequest::command("echo x"))
            .await
            .unwrap();
        orchestrator.wait_for(&[id]).await;
        assert!(!orchestrator.cancel(id).await.unwrap());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_dependency_unblocks_after_completion() {
        let orchestrator = started(2, 1).await;
        let first = orchestrator
            .submit(TaskRequest::command("echo first"))
            .await
            .unwrap();
        let second = orchestrator
            .submit(TaskRequest::command("echo second").with_depends_on(vec![first]))
            .await
            .unwrap();

        orchestrator.wait_for(&[first, second]).await;
        let first_task = orchestrator.task(first).await.unwrap();
        let second_task = orchestrator.task(second).await.unwrap();
        assert_eq!(second_task.state, TaskState::Completed);
        assert!(second_task.started_at.unwrap() >= first_task.completed_at.unwrap());
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let orchestrator = started(1, 0).await;
        orchestrator.shutdown().await;
        let result = orchestrator.submit(TaskRequest::command("echo x")).await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_status_reflects_queue_and_pool() {
        let orchestrator = started(3, 2).await;
        let status = orchestrator.status().await;
        assert_eq!(status.instances.total, 2);
        assert_eq!(status.total_tasks, 0);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_scale_and_instance_views() {
        let orchestrator = started(4, 1).await;
        assert_eq!(orchestrator.scale(3).await, 3);
        assert_eq!(orchestrator.instances().await.len(), 3);
        assert_eq!(orchestrator.idle_workers().await.len(), 3);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_respected_on_single_worker() {
        let orchestrator = started(1, 1).await;
        // Occupy the worker, then queue a low and a critical task.
        let blocker = orchestrator
            .submit(TaskRequest::command("sleep 0.4"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let low = orchestrator
            .submit(TaskRequest::command("echo low").with_priority(TaskPriority::Low))
            .await
            .unwrap();
        let critical = orchestrator
            .submit(TaskRequest::command("echo critical").with_priority(TaskPriority::Critical))
            .await
            .unwrap();

        orchestrator.wait_for(&[blocker, low, critical]).await;
        let low_task = orchestrator.task(low).await.unwrap();
        let critical_task = orchestrator.task(critical).await.unwrap();
        assert!(critical_task.started_at.unwrap() <= low_task.started_at.unwrap());
        orchestrator.shutdown().await;
    }
}
