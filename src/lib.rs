//! Hive: an orchestrator for a pool of long-lived command-line worker
//! processes.
//!
//! Clients submit individual tasks or YAML-defined workflows; the engine
//! schedules them across a health-checked pool of subprocess workers with
//! priority, dependency, and affinity constraints, and streams progress
//! events over a REST/WebSocket surface.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod orchestration;
pub mod workflow;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use orchestration::{Orchestrator, StatusReport};
