//! Orchestration layer: workers, the pool, and the dispatch loops.
//!
//! This module provides the components that turn queued tasks into
//! running child processes: the `Worker` subprocess wrapper, the
//! `InstancePool` managing worker lifecycle and allocation, and the
//! `Orchestrator` pumping tasks from the queue to the pool.

pub mod orchestrator;
pub mod pool;
pub mod worker;

pub use orchestrator::{Orchestrator, StatusReport};
pub use pool::{InstancePool, PoolSettings, PoolStats, WorkerInfo, WorkerLease};
pub use worker::{
    ModelProfile, OutputRing, Worker, WorkerId, WorkerState, DEFAULT_OUTPUT_BUFFER_BYTES,
    END_MARKER,
};
