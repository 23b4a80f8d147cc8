//! Worker pool for multi-instance management.
//!
//! The `InstancePool` owns the roster of workers, enforces the
//! `max_instances` capacity limit, allocates idle workers to dispatchers,
//! and reaps dead workers in a periodic health sweep. Lifecycle changes
//! are published on the event bus.
//!
//! The roster is mutated only while the caller holds the pool lock; the
//! worker process itself lives behind its own mutex so a dispatcher can
//! run a task without holding the pool lock across the execution.

use crate::core::task::TaskId;
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::orchestration::worker::{
    ModelProfile, OutputRing, Worker, WorkerId, WorkerState, DEFAULT_OUTPUT_BUFFER_BYTES,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool construction parameters, derived from the crate configuration.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Hard upper bound on pool cardinality.
    pub max_instances: usize,
    /// Back-end profile used for every spawned worker.
    pub profile: ModelProfile,
    /// Working directory for workers spawned without an explicit one.
    pub default_working_directory: Option<PathBuf>,
    /// Startup delay for the readiness probe.
    pub startup_grace: Duration,
    /// Grace period between polite termination and kill.
    pub stop_grace: Duration,
    /// Byte budget of each worker's output ring.
    pub output_buffer_bytes: usize,
    /// Respawn reaped workers during the health sweep.
    pub auto_heal: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_instances: 5,
            profile: ModelProfile::shell(),
            default_working_directory: None,
            startup_grace: Duration::from_millis(200),
            stop_grace: Duration::from_secs(2),
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            auto_heal: true,
        }
    }
}

/// A claim on a busy worker, handed to the dispatcher that acquired it.
///
/// The process mutex is uncontended while the worker is busy: the owning
/// dispatcher is the only locker until it releases the worker.
#[derive(Debug, Clone)]
pub struct WorkerLease {
    pub id: WorkerId,
    /// The worker process, locked by the owning dispatcher for execution.
    pub proc: Arc<Mutex<Worker>>,
    /// Cancelled when the pool terminates this worker out from under its
    /// dispatcher.
    pub cancel: CancellationToken,
}

/// Serializable view of one worker for status and listing endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub state: WorkerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<PathBuf>,
    pub model: String,
    pub draining: bool,
    pub started_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub completed_tasks: u64,
    pub error_count: u64,
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub max_instances: usize,
}

/// Roster entry: worker metadata plus the shared process handle.
struct Slot {
    state: WorkerState,
    current_task: Option<TaskId>,
    draining: bool,
    working_directory: Option<PathBuf>,
    model: String,
    started_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    /// Monotonic timestamp for least-recently-used selection.
    lru: Instant,
    completed_tasks: u64,
    error_count: u64,
    cancel: CancellationToken,
    proc: Arc<Mutex<Worker>>,
    output: Arc<StdMutex<OutputRing>>,
}

impl Slot {
    fn info(&self, id: WorkerId) -> WorkerInfo {
        WorkerInfo {
            id,
            state: self.state,
            current_task: self.current_task,
            working_directory: self.working_directory.clone(),
            model: self.model.clone(),
            draining: self.draining,
            started_at: self.started_at,
            last_active_at: self.last_active_at,
            completed_tasks: self.completed_tasks,
            error_count: self.error_count,
        }
    }
}

/// Manages the set of workers and allocates them to tasks.
pub struct InstancePool {
    slots: BTreeMap<WorkerId, Slot>,
    next_id: u64,
    /// Cardinality the pool should hold. Raised by spawns, lowered by
    /// explicit terminations and scale-downs; the health sweep tops the
    /// pool back up to this after workers are disposed mid-task.
    desired: usize,
    settings: PoolSettings,
    events: EventBus,
}

impl InstancePool {
    pub fn new(settings: PoolSettings, events: EventBus) -> Self {
        Self {
            slots: BTreeMap::new(),
            next_id: 0,
            desired: 0,
            settings,
            events,
        }
    }

    /// Spawn up to `count` workers.
    ///
    /// Rejected outright with `CapacityExceeded` when the request cannot
    /// fit under `max_instances`. Individual spawn failures skip the
    /// failed slot; the successfully spawned ids are returned.
    pub async fn spawn(
        &mut self,
        count: usize,
        working_directory: Option<PathBuf>,
    ) -> Result<Vec<WorkerId>> {
        if self.slots.len() + count > self.settings.max_instances {
            return Err(Error::CapacityExceeded {
                max: self.settings.max_instances,
            });
        }
        let mut spawned = Vec::with_capacity(count);
        for _ in 0..count {
            match self.spawn_one(working_directory.clone()).await {
                Ok(id) => spawned.push(id),
                Err(e) => warn!(error = %e, "failed to spawn worker"),
            }
        }
        Ok(spawned)
    }

    /// Spawn a single worker and register it as idle.
    async fn spawn_one(&mut self, working_directory: Option<PathBuf>) -> Result<WorkerId> {
        if self.slots.len() >= self.settings.max_instances {
            return Err(Error::CapacityExceeded {
                max: self.settings.max_instances,
            });
        }
        self.next_id += 1;
        let id = WorkerId(self.next_id);
        let dir = working_directory.or_else(|| self.settings.default_working_directory.clone());

        let mut worker = Worker::new(
            id,
            self.settings.profile.clone(),
            dir.clone(),
            self.settings.output_buffer_bytes,
        );
        worker.start(self.settings.startup_grace).await?;

        let now = Utc::now();
        let slot = Slot {
            state: WorkerState::Idle,
            current_task: None,
            draining: false,
            working_directory: dir,
            model: self.settings.profile.label(),
            started_at: now,
            last_active_at: now,
            lru: Instant::now(),
            completed_tasks: 0,
            error_count: 0,
            cancel: CancellationToken::new(),
            output: worker.output_handle(),
            proc: Arc::new(Mutex::new(worker)),
        };
        self.slots.insert(id, slot);
        self.desired = self.desired.max(self.slots.len());
        info!(worker = %id, total = self.slots.len(), "worker spawned");
        self.events.publish(Event::InstanceSpawned { worker_id: id });
        Ok(id)
    }

    /// Terminate a worker.
    ///
    /// An idle worker is stopped and removed immediately. A busy worker
    /// has its lease token cancelled; the owning dispatcher interrupts
    /// the execution, records `"worker-terminated"` on the task, and the
    /// release removes the slot.
    pub async fn terminate(&mut self, id: WorkerId) -> Result<()> {
        let busy = {
            let slot = self.slots.get(&id).ok_or(Error::UnknownWorker(id))?;
            slot.state == WorkerState::Busy
        };
        self.desired = self.desired.saturating_sub(1);

        if busy {
            let slot = self.slots.get_mut(&id).ok_or(Error::UnknownWorker(id))?;
            slot.state = WorkerState::Terminated;
            slot.cancel.cancel();
            debug!(worker = %id, "busy worker marked terminated; dispatcher will release");
            return Ok(());
        }

        if let Some(slot) = self.slots.remove(&id) {
            slot.proc.lock().await.stop(self.settings.stop_grace).await;
            info!(worker = %id, remaining = self.slots.len(), "worker terminated");
            self.events
                .publish(Event::InstanceTerminated { worker_id: id });
        }
        Ok(())
    }

    /// Scale the pool toward `target` workers. Idempotent.
    ///
    /// Scaling up spawns at most to `max_instances`, with a warning when
    /// the target cannot be reached. Scaling down terminates idle workers
    /// first and marks any remaining excess busy workers as draining:
    /// they finish their current task and are then terminated on release.
    ///
    /// Returns the pool cardinality after the operation.
    pub async fn scale_to(&mut self, target: usize) -> usize {
        let current = self.slots.len();
        if target > current {
            let reachable = target.min(self.settings.max_instances);
            if reachable < target {
                warn!(
                    target,
                    max = self.settings.max_instances,
                    "scale target exceeds max_instances; scaling to max"
                );
            }
            for _ in current..reachable {
                if let Err(e) = self.spawn_one(None).await {
                    warn!(error = %e, "scale-up spawn failed");
                }
            }
        } else if target < current {
            let mut excess = current - target;

            // Newest idle workers go first.
            let idle: Vec<WorkerId> = self
                .slots
                .iter()
                .rev()
                .filter(|(_, s)| s.state == WorkerState::Idle)
                .map(|(id, _)| *id)
                .take(excess)
                .collect();
            for id in idle {
                let _ = self.terminate(id).await;
                excess -= 1;
            }

            // Busy workers are never preempted; drain them instead.
            if excess > 0 {
                let busy: Vec<WorkerId> = self
                    .slots
                    .iter()
                    .rev()
                    .filter(|(_, s)| s.state == WorkerState::Busy && !s.draining)
                    .map(|(id, _)| *id)
                    .take(excess)
                    .collect();
                for id in busy {
                    if let Some(slot) = self.slots.get_mut(&id) {
                        slot.draining = true;
                        debug!(worker = %id, "worker draining");
                    }
                }
            }
        }
        self.desired = target.min(self.settings.max_instances);
        self.slots.len()
    }

    /// Hand an idle worker to a dispatcher for `task`. Non-blocking:
    /// returns `None` rather than waiting when nothing is available.
    ///
    /// With `pinned` set, only that exact worker qualifies. Otherwise the
    /// least-recently-used idle worker wins, ties broken by ascending id.
    pub fn acquire(&mut self, task: TaskId, pinned: Option<WorkerId>) -> Option<WorkerLease> {
        let chosen = match pinned {
            Some(id) => {
                let slot = self.slots.get(&id)?;
                if slot.state == WorkerState::Idle && !slot.draining {
                    Some(id)
                } else {
                    None
                }
            }
            None => {
                let mut best: Option<(WorkerId, Instant)> = None;
                for (id, slot) in &self.slots {
                    if slot.state != WorkerState::Idle || slot.draining {
                        continue;
                    }
                    match best {
                        Some((_, lru)) if slot.lru >= lru => {}
                        _ => best = Some((*id, slot.lru)),
                    }
                }
                best.map(|(id, _)| id)
            }
        }?;

        let slot = self.slots.get_mut(&chosen)?;
        slot.state = WorkerState::Busy;
        slot.current_task = Some(task);
        slot.last_active_at = Utc::now();
        slot.lru = Instant::now();
        Some(WorkerLease {
            id: chosen,
            proc: Arc::clone(&slot.proc),
            cancel: slot.cancel.clone(),
        })
    }

    /// Return a busy worker to the roster.
    ///
    /// `next` is the dispatcher's verdict (`Idle` when the execution left
    /// the child healthy, `Unhealthy` or `Terminated` otherwise); a
    /// draining or externally terminated worker ends up `Terminated`
    /// regardless. `task_succeeded` feeds the per-worker counters.
    pub fn release(&mut self, id: WorkerId, next: WorkerState, task_succeeded: bool) {
        let externally_terminated = match self.slots.get(&id) {
            Some(slot) => slot.state == WorkerState::Terminated,
            None => return,
        };

        let remove = {
            let slot = match self.slots.get_mut(&id) {
                Some(slot) => slot,
                None => return,
            };
            if task_succeeded {
                slot.completed_tasks += 1;
            } else {
                slot.error_count += 1;
            }
            slot.current_task = None;
            slot.last_active_at = Utc::now();

            if externally_terminated || slot.draining || next == WorkerState::Terminated {
                true
            } else {
                slot.state = next;
                false
            }
        };

        if remove {
            self.slots.remove(&id);
            info!(worker = %id, remaining = self.slots.len(), "worker released terminated");
            self.events
                .publish(Event::InstanceTerminated { worker_id: id });
        }
    }

    /// Probe every non-busy worker and reap the dead ones; with auto-heal
    /// enabled, the pool is topped back up to its desired cardinality,
    /// replacing both reaped workers and workers disposed mid-task.
    ///
    /// Returns `(reaped, respawned)` counts.
    pub async fn health_sweep(&mut self) -> (usize, usize) {
        let candidates: Vec<WorkerId> = self
            .slots
            .iter()
            .filter(|(_, s)| s.state != WorkerState::Busy)
            .map(|(id, _)| *id)
            .collect();

        let mut reaped = 0;
        for id in candidates {
            let dead = {
                let slot = match self.slots.get(&id) {
                    Some(slot) => slot,
                    None => continue,
                };
                slot.state == WorkerState::Unhealthy
                    || !slot.proc.lock().await.health_probe()
            };
            if dead {
                if let Some(slot) = self.slots.remove(&id) {
                    slot.proc.lock().await.stop(self.settings.stop_grace).await;
                    warn!(worker = %id, "health sweep reaped dead worker");
                    self.events
                        .publish(Event::InstanceTerminated { worker_id: id });
                    reaped += 1;
                }
            }
        }

        let mut respawned = 0;
        if self.settings.auto_heal {
            while self.slots.len() < self.desired
                && self.slots.len() < self.settings.max_instances
            {
                match self.spawn_one(None).await {
                    Ok(_) => respawned += 1,
                    Err(e) => {
                        warn!(error = %e, "auto-heal respawn failed");
                        break;
                    }
                }
            }
        }
        (reaped, respawned)
    }

    /// Idle, non-draining workers in ascending id order.
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|(_, s)| s.state == WorkerState::Idle && !s.draining)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Aggregate pool counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.slots.len(),
            idle: 0,
            busy: 0,
            unhealthy: 0,
            max_instances: self.settings.max_instances,
        };
        for slot in self.slots.values() {
            match slot.state {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Unhealthy => stats.unhealthy += 1,
                _ => {}
            }
        }
        stats
    }

    /// All workers in ascending id order.
    pub fn list(&self) -> Vec<WorkerInfo> {
        self.slots.iter().map(|(id, slot)| slot.info(*id)).collect()
    }

    /// One worker's view, if present.
    pub fn get(&self, id: WorkerId) -> Option<WorkerInfo> {
        self.slots.get(&id).map(|slot| slot.info(id))
    }

    /// The most recent `count` output lines from a worker's ring buffer.
    pub fn recent_output(&self, id: WorkerId, count: usize) -> Result<Vec<String>> {
        let slot = self.slots.get(&id).ok_or(Error::UnknownWorker(id))?;
        Ok(slot
            .output
            .lock()
            .map(|ring| ring.tail(count))
            .unwrap_or_default())
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stop and remove every worker, concurrently. Used during shutdown,
    /// after the dispatchers have drained.
    pub async fn terminate_all(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        self.desired = 0;
        let stop_grace = self.settings.stop_grace;
        for slot in slots.values() {
            slot.cancel.cancel();
        }
        let stops = slots.values().map(|slot| {
            let proc = Arc::clone(&slot.proc);
            async move {
                proc.lock().await.stop(stop_grace).await;
            }
        });
        futures::future::join_all(stops).await;
        for id in slots.keys() {
            self.events
                .publish(Event::InstanceTerminated { worker_id: *id });
        }
        info!("all workers terminated");
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("workers", &self.slots.len())
            .field("max_instances", &self.settings.max_instances)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskId;

    fn settings(max: usize) -> PoolSettings {
        PoolSettings {
            max_instances: max,
            startup_grace: Duration::from_millis(50),
            stop_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    fn pool(max: usize) -> InstancePool {
        InstancePool::new(settings(max), EventBus::new(64))
    }

    // ========== Spawn Tests ==========

    #[tokio::test]
    async fn test_spawn_assigns_ascending_ids() {
        let mut pool = pool(4);
        let ids = pool.spawn(3, None).await.unwrap();
        assert_eq!(ids, vec![WorkerId(1), WorkerId(2), WorkerId(3)]);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_spawn_over_capacity_rejected() {
        let mut pool = pool(2);
        pool.spawn(2, None).await.unwrap();
        let result = pool.spawn(1, None).await;
        assert!(matches!(result, Err(Error::CapacityExceeded { max: 2 })));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_emits_events() {
        let events = EventBus::new(64);
        let mut stream = events.subscribe();
        let mut pool = InstancePool::new(settings(2), events);
        let ids = pool.spawn(1, None).await.unwrap();

        match stream.try_recv() {
            Some(Event::InstanceSpawned { worker_id }) => assert_eq!(worker_id, ids[0]),
            other => panic!("expected InstanceSpawned, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_pool_unchanged() {
        let mut settings = settings(3);
        settings.profile.program = "/nonexistent/worker".to_string();
        let mut pool = InstancePool::new(settings, EventBus::new(8));
        let ids = pool.spawn(2, None).await.unwrap();
        assert!(ids.is_empty());
        assert!(pool.is_empty());
    }

    // ========== Acquire / Release Tests ==========

    #[tokio::test]
    async fn test_acquire_from_empty_pool() {
        let mut pool = pool(2);
        assert!(pool.acquire(TaskId::new(), None).is_none());
    }

    #[tokio::test]
    async fn test_acquire_marks_busy() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        assert_eq!(lease.id, WorkerId(1));
        assert_eq!(pool.stats().busy, 1);
        assert_eq!(pool.stats().idle, 0);
        assert!(pool.acquire(TaskId::new(), None).is_none());
    }

    #[tokio::test]
    async fn test_acquire_prefers_least_recently_used() {
        let mut pool = pool(3);
        pool.spawn(2, None).await.unwrap();

        // Use worker 1, release it; worker 2 is now least recently used.
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        assert_eq!(lease.id, WorkerId(1));
        pool.release(lease.id, WorkerState::Idle, true);

        let lease = pool.acquire(TaskId::new(), None).unwrap();
        assert_eq!(lease.id, WorkerId(2));
    }

    #[tokio::test]
    async fn test_acquire_pinned() {
        let mut pool = pool(3);
        pool.spawn(2, None).await.unwrap();

        let lease = pool.acquire(TaskId::new(), Some(WorkerId(2))).unwrap();
        assert_eq!(lease.id, WorkerId(2));
        // Pinned worker busy: nothing else qualifies.
        assert!(pool.acquire(TaskId::new(), Some(WorkerId(2))).is_none());
        // Unpinned still finds worker 1.
        assert!(pool.acquire(TaskId::new(), None).is_some());
    }

    #[tokio::test]
    async fn test_acquire_pinned_unknown_worker() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        assert!(pool.acquire(TaskId::new(), Some(WorkerId(99))).is_none());
    }

    #[tokio::test]
    async fn test_release_idle_returns_worker_to_rotation() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        pool.release(lease.id, WorkerState::Idle, true);

        assert_eq!(pool.stats().idle, 1);
        let info = pool.get(WorkerId(1)).unwrap();
        assert_eq!(info.completed_tasks, 1);
        assert!(info.current_task.is_none());
    }

    #[tokio::test]
    async fn test_release_unhealthy_counts_error() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        pool.release(lease.id, WorkerState::Unhealthy, false);

        let info = pool.get(WorkerId(1)).unwrap();
        assert_eq!(info.state, WorkerState::Unhealthy);
        assert_eq!(info.error_count, 1);
        assert!(pool.acquire(TaskId::new(), None).is_none());
    }

    #[tokio::test]
    async fn test_release_terminated_removes_slot() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        pool.release(lease.id, WorkerState::Terminated, false);
        assert!(pool.is_empty());
    }

    // ========== Terminate Tests ==========

    #[tokio::test]
    async fn test_terminate_idle_worker() {
        let mut pool = pool(2);
        let ids = pool.spawn(1, None).await.unwrap();
        pool.terminate(ids[0]).await.unwrap();
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unknown_worker() {
        let mut pool = pool(2);
        assert!(matches!(
            pool.terminate(WorkerId(9)).await,
            Err(Error::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_busy_worker_cancels_lease() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        assert!(!lease.cancel.is_cancelled());

        pool.terminate(lease.id).await.unwrap();
        assert!(lease.cancel.is_cancelled());
        // Slot survives until the dispatcher releases.
        assert_eq!(pool.len(), 1);
        pool.release(lease.id, WorkerState::Terminated, false);
        assert!(pool.is_empty());
    }

    // ========== Scaling Tests ==========

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let mut pool = pool(4);
        assert_eq!(pool.scale_to(3).await, 3);
        assert_eq!(pool.scale_to(1).await, 1);
    }

    #[tokio::test]
    async fn test_scale_to_is_idempotent() {
        let mut pool = pool(4);
        assert_eq!(pool.scale_to(2).await, 2);
        let ids_before: Vec<WorkerId> = pool.list().iter().map(|w| w.id).collect();
        assert_eq!(pool.scale_to(2).await, 2);
        let ids_after: Vec<WorkerId> = pool.list().iter().map(|w| w.id).collect();
        assert_eq!(ids_before, ids_after);
    }

    #[tokio::test]
    async fn test_scale_clamps_to_max_instances() {
        let mut pool = pool(2);
        assert_eq!(pool.scale_to(10).await, 2);
    }

    #[tokio::test]
    async fn test_scale_down_drains_busy_workers() {
        let mut pool = pool(2);
        pool.spawn(2, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();

        assert_eq!(pool.scale_to(0).await, 1);
        let info = pool.get(lease.id).unwrap();
        assert!(info.draining);

        // Draining worker is terminated on release, not preempted.
        pool.release(lease.id, WorkerState::Idle, true);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_draining_worker_not_acquirable() {
        let mut pool = pool(2);
        pool.spawn(2, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        pool.scale_to(0).await;
        // Worker 2 was idle and terminated; worker 1 is draining.
        assert_eq!(pool.len(), 1);
        assert!(pool.acquire(TaskId::new(), Some(lease.id)).is_none());
    }

    // ========== Health Sweep Tests ==========

    #[tokio::test]
    async fn test_health_sweep_reaps_dead_worker() {
        let mut pool = pool(2);
        let ids = pool.spawn(1, None).await.unwrap();

        // Kill the child behind the pool's back.
        {
            let slot = pool.slots.get(&ids[0]).unwrap();
            slot.proc.lock().await.stop(Duration::from_millis(50)).await;
        }

        let mut settings_no_heal = pool.settings.clone();
        settings_no_heal.auto_heal = false;
        pool.settings = settings_no_heal;

        let (reaped, respawned) = pool.health_sweep().await;
        assert_eq!(reaped, 1);
        assert_eq!(respawned, 0);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_health_sweep_auto_heals() {
        let mut pool = pool(2);
        let ids = pool.spawn(1, None).await.unwrap();
        {
            let slot = pool.slots.get(&ids[0]).unwrap();
            slot.proc.lock().await.stop(Duration::from_millis(50)).await;
        }

        let (reaped, respawned) = pool.health_sweep().await;
        assert_eq!(reaped, 1);
        assert_eq!(respawned, 1);
        // A replacement with a fresh id took its place.
        assert_eq!(pool.len(), 1);
        assert!(pool.get(ids[0]).is_none());
        assert!(pool.get(WorkerId(2)).is_some());
    }

    #[tokio::test]
    async fn test_health_sweep_reaps_unhealthy_released_worker() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();
        pool.release(lease.id, WorkerState::Unhealthy, false);

        let (reaped, respawned) = pool.health_sweep().await;
        assert_eq!(reaped, 1);
        assert_eq!(respawned, 1);
    }

    #[tokio::test]
    async fn test_health_sweep_leaves_healthy_workers() {
        let mut pool = pool(2);
        pool.spawn(2, None).await.unwrap();
        assert_eq!(pool.health_sweep().await, (0, 0));
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_health_sweep_replaces_worker_disposed_mid_task() {
        let mut pool = pool(2);
        pool.spawn(1, None).await.unwrap();
        let lease = pool.acquire(TaskId::new(), None).unwrap();

        // The dispatcher disposed the worker after an interrupted task.
        pool.release(lease.id, WorkerState::Terminated, false);
        assert!(pool.is_empty());

        let (reaped, respawned) = pool.health_sweep().await;
        assert_eq!(reaped, 0);
        assert_eq!(respawned, 1);
        assert_eq!(pool.len(), 1);
    }

    // ========== View Tests ==========

    #[tokio::test]
    async fn test_stats_counts() {
        let mut pool = pool(4);
        pool.spawn(3, None).await.unwrap();
        pool.acquire(TaskId::new(), None).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.max_instances, 4);
    }

    #[tokio::test]
    async fn test_idle_workers_ascending() {
        let mut pool = pool(4);
        pool.spawn(3, None).await.unwrap();
        pool.acquire(TaskId::new(), Some(WorkerId(2))).unwrap();
        assert_eq!(pool.idle_workers(), vec![WorkerId(1), WorkerId(3)]);
    }

    #[tokio::test]
    async fn test_list_and_get() {
        let mut pool = pool(2);
        pool.spawn(2, None).await.unwrap();
        assert_eq!(pool.list().len(), 2);
        assert!(pool.get(WorkerId(1)).is_some());
        assert!(pool.get(WorkerId(5)).is_none());
    }

    #[tokio::test]
    async fn test_recent_output_unknown_worker() {
        let pool = pool(2);
        assert!(matches!(
            pool.recent_output(WorkerId(1), 10),
            Err(Error::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let mut pool = pool(3);
        pool.spawn(3, None).await.unwrap();
        pool.terminate_all().await;
        assert!(pool.is_empty());
    }
}
