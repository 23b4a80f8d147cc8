//! Crate configuration: TOML file plus `HIVE_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::orchestration::pool::PoolSettings;
use crate::orchestration::worker::{ModelProfile, DEFAULT_OUTPUT_BUFFER_BYTES};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hard cap on pool cardinality.
    pub max_instances: usize,
    /// Workers spawned at startup.
    pub initial_instances: usize,
    /// Dispatcher loop count; defaults to `max_instances` when unset.
    pub dispatchers: Option<usize>,
    /// Program hosting each worker.
    pub worker_program: String,
    /// Arguments for the worker program.
    pub worker_args: Vec<String>,
    /// Template used to run prompt payloads; `{prompt}` is substituted.
    pub prompt_command: String,
    /// Model label surfaced in instance listings.
    pub model: Option<String>,
    /// Default working directory for workers.
    pub workspace_root: Option<PathBuf>,
    /// Default task timeout in seconds.
    pub default_timeout_secs: u64,
    /// Worker readiness probe delay in milliseconds.
    pub startup_grace_ms: u64,
    /// Grace between polite termination and kill, in milliseconds.
    pub stop_grace_ms: u64,
    /// Per-worker output ring budget in bytes.
    pub output_buffer_bytes: usize,
    /// Health sweep period in seconds.
    pub health_sweep_secs: u64,
    /// Respawn reaped workers automatically.
    pub auto_heal: bool,
    /// REST/WebSocket listen address.
    pub listen_addr: SocketAddr,
    /// Per-subscriber event buffer capacity.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_instances: 5,
            initial_instances: 1,
            dispatchers: None,
            worker_program: "/bin/sh".to_string(),
            worker_args: Vec::new(),
            prompt_command: "claude -p {prompt} --output-format text".to_string(),
            model: None,
            workspace_root: None,
            default_timeout_secs: 300,
            startup_grace_ms: 200,
            stop_grace_ms: 2000,
            output_buffer_bytes: DEFAULT_OUTPUT_BUFFER_BYTES,
            health_sweep_secs: 10,
            auto_heal: true,
            listen_addr: "127.0.0.1:7700".parse().expect("valid default addr"),
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Default config location: `~/.hive/hive.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".hive").join("hive.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit path must exist; the default path is optional. After
    /// the file layer, `HIVE_*` environment variables are applied, then
    /// the result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path).map_err(|e| {
                    Error::Configuration(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&raw)?
            }
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => {
                    let raw = fs::read_to_string(&path)?;
                    toml::from_str(&raw)?
                }
                None => Self::default(),
            },
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Layer `HIVE_*` environment variables over the file values.
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("HIVE_MAX_INSTANCES") {
            if let Ok(n) = v.parse() {
                self.max_instances = n;
            }
        }
        if let Ok(v) = std::env::var("HIVE_INITIAL_INSTANCES") {
            if let Ok(n) = v.parse() {
                self.initial_instances = n;
            }
        }
        if let Ok(v) = std::env::var("HIVE_WORKER_PROGRAM") {
            self.worker_program = v;
        }
        if let Ok(v) = std::env::var("HIVE_PROMPT_COMMAND") {
            self.prompt_command = v;
        }
        if let Ok(v) = std::env::var("HIVE_DEFAULT_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                self.default_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("HIVE_LISTEN_ADDR") {
            if let Ok(addr) = v.parse() {
                self.listen_addr = addr;
            }
        }
        if let Ok(v) = std::env::var("HIVE_WORKSPACE_ROOT") {
            self.workspace_root = Some(PathBuf::from(v));
        }
    }

    /// Reject configurations the orchestrator cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_instances == 0 {
            return Err(Error::Configuration(
                "max_instances must be at least 1".to_string(),
            ));
        }
        if self.initial_instances > self.max_instances {
            return Err(Error::Configuration(format!(
                "initial_instances {} exceeds max_instances {}",
                self.initial_instances, self.max_instances
            )));
        }
        if self.default_timeout_secs == 0 {
            return Err(Error::Configuration(
                "default_timeout_secs must be at least 1".to_string(),
            ));
        }
        if which::which(&self.worker_program).is_err() {
            return Err(Error::Configuration(format!(
                "worker program not found: {}",
                self.worker_program
            )));
        }
        if let Some(root) = &self.workspace_root {
            if !root.is_dir() {
                return Err(Error::Configuration(format!(
                    "workspace_root is not a directory: {}",
                    root.display()
                )));
            }
        }
        Ok(())
    }

    /// The worker back-end profile described by this configuration.
    pub fn model_profile(&self) -> ModelProfile {
        ModelProfile {
            program: self.worker_program.clone(),
            args: self.worker_args.clone(),
            prompt_command: self.prompt_command.clone(),
            model: self.model.clone(),
        }
    }

    /// Pool settings derived from this configuration.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_instances: self.max_instances,
            profile: self.model_profile(),
            default_working_directory: self.workspace_root.clone(),
            startup_grace: Duration::from_millis(self.startup_grace_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            output_buffer_bytes: self.output_buffer_bytes,
            auto_heal: self.auto_heal,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn health_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.health_sweep_secs.max(1))
    }

    /// Number of dispatcher loops to run.
    pub fn dispatcher_count(&self) -> usize {
        self.dispatchers.unwrap_or(self.max_instances).max(1)
    }
}
