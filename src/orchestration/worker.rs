//! Worker wrapper around one long-lived external child process.
//!
//! A worker owns its child process and I/O streams exclusively. Requests
//! are written to the child's stdin as shell script fragments; the
//! response is everything up to an end-of-response marker line carrying
//! the exit code. The default profile drives a POSIX shell, with prompts
//! routed through a configurable prompt command, so any command-line
//! model back-end that can be invoked from a shell satisfies the same
//! contract.

use crate::core::task::{TaskPayload, TaskResult, REASON_PROCESS_EXITED, REASON_TIMEOUT};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Marker line terminating each worker response; followed by the exit code.
pub const END_MARKER: &str = "@@hive:done";

/// Default size of the per-worker output ring buffer.
pub const DEFAULT_OUTPUT_BUFFER_BYTES: usize = 64 * 1024;

/// Unique identifier for a worker, stable for the worker's lifetime.
///
/// Ids are assigned sequentially by the pool; selection policies and
/// workflow pinning are defined in ascending-id order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Worker state in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Child spawned, readiness probe not yet passed.
    Starting,
    /// Alive and available for a task.
    Idle,
    /// Executing exactly one task.
    Busy,
    /// Probe or execution failure; awaiting reaping by the health sweep.
    Unhealthy,
    /// Stopped and released.
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Busy => write!(f, "busy"),
            WorkerState::Unhealthy => write!(f, "unhealthy"),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Back-end descriptor: which program hosts the worker and how prompts
/// are translated into invocations inside it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelProfile {
    /// Program spawned as the long-lived child.
    pub program: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
    /// Template for prompt payloads; `{prompt}` is replaced with the
    /// shell-quoted prompt text.
    pub prompt_command: String,
    /// Optional model label, surfaced in instance listings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ModelProfile {
    /// The default back-end: a POSIX shell with prompts routed through
    /// the `claude` CLI.
    pub fn shell() -> Self {
        Self {
            program: "/bin/sh".to_string(),
            args: Vec::new(),
            prompt_command: "claude -p {prompt} --output-format text".to_string(),
            model: None,
        }
    }

    /// Label shown in instance listings.
    pub fn label(&self) -> String {
        self.model.clone().unwrap_or_else(|| self.program.clone())
    }

    /// Render a payload into the script fragment written to the child.
    ///
    /// The fragment runs the work in a subshell so directory changes do
    /// not leak, then prints the end-of-response marker with the exit
    /// code.
    pub fn render_request(&self, payload: &TaskPayload) -> String {
        let mut script = String::from("(\n");
        match payload {
            TaskPayload::Command {
                command,
                working_directory,
            } => {
                if let Some(dir) = working_directory {
                    script.push_str(&format!(
                        "cd {} || exit 1\n",
                        sh_quote(&dir.to_string_lossy())
                    ));
                }
                script.push_str(command);
                script.push('\n');
            }
            TaskPayload::Prompt { prompt } => {
                script.push_str(&self.prompt_command.replace("{prompt}", &sh_quote(prompt)));
                script.push('\n');
            }
        }
        script.push_str(")\n");
        script.push_str(&format!("printf '{} %s\\n' \"$?\"\n", END_MARKER));
        script
    }
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self::shell()
    }
}

/// Quote a string for safe interpolation into a POSIX shell word.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Bounded ring of recent output lines; oldest lines are dropped when the
/// byte budget is exceeded.
#[derive(Debug)]
pub struct OutputRing {
    lines: VecDeque<String>,
    bytes: usize,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting from the front until within budget.
    pub fn push(&mut self, line: String) {
        self.bytes += line.len();
        self.lines.push_back(line);
        while self.bytes > self.capacity && self.lines.len() > 1 {
            if let Some(evicted) = self.lines.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    /// The most recent `count` lines, oldest first.
    pub fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Outcome of a single execution, including whether the worker survived.
#[derive(Debug)]
pub struct ExecOutcome {
    pub result: TaskResult,
    /// False when the child was killed or died; the worker is disposable.
    pub worker_alive: bool,
}

/// One long-lived external child process acting as a unit of execution.
pub struct Worker {
    id: WorkerId,
    profile: ModelProfile,
    working_directory: Option<PathBuf>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    output: Arc<Mutex<OutputRing>>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl Worker {
    /// Create a worker; the child is not spawned until `start`.
    pub fn new(
        id: WorkerId,
        profile: ModelProfile,
        working_directory: Option<PathBuf>,
        output_capacity: usize,
    ) -> Self {
        Self {
            id,
            profile,
            working_directory,
            child: None,
            stdin: None,
            stdout: None,
            output: Arc::new(Mutex::new(OutputRing::new(output_capacity))),
            stderr_drain: None,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn profile(&self) -> &ModelProfile {
        &self.profile
    }

    /// Shared handle to the output ring, readable while the worker runs.
    pub fn output_handle(&self) -> Arc<Mutex<OutputRing>> {
        Arc::clone(&self.output)
    }

    /// Spawn the child process and wait for the readiness probe.
    ///
    /// Readiness is a bounded startup delay without an error exit: if the
    /// child dies within `startup_grace`, startup has failed.
    pub async fn start(&mut self, startup_grace: Duration) -> Result<()> {
        let mut command = Command::new(&self.profile.program);
        command
            .args(&self.profile.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| Error::WorkerStartFailure {
            reason: format!("spawn {}: {}", self.profile.program, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::WorkerStartFailure {
            reason: "child stdin not captured".to_string(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::WorkerStartFailure {
                reason: "child stdout not captured".to_string(),
            })?;

        // Drain stderr continuously so the OS pipe buffer never fills.
        if let Some(stderr) = child.stderr.take() {
            let ring = Arc::clone(&self.output);
            self.stderr_drain = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Ok(mut ring) = ring.lock() {
                        ring.push(line);
                    }
                }
            }));
        }

        tokio::time::sleep(startup_grace).await;
        match child.try_wait() {
            Ok(None) => {
                self.child = Some(child);
                self.stdin = Some(stdin);
                self.stdout = Some(BufReader::new(stdout).lines());
                Ok(())
            }
            Ok(Some(status)) => Err(Error::WorkerStartFailure {
                reason: format!("exited during startup: {}", status),
            }),
            Err(e) => Err(Error::WorkerStartFailure {
                reason: e.to_string(),
            }),
        }
    }

    /// Execute one payload, bounded by `timeout`.
    ///
    /// On success the result carries the worker's output and reported
    /// exit code and the worker stays alive. On timeout, I/O failure, or
    /// unexpected child exit, the child is killed and `worker_alive` is
    /// false; the caller decides how to replace the worker.
    pub async fn execute(&mut self, payload: &TaskPayload, timeout: Duration) -> ExecOutcome {
        let started = Instant::now();
        let request = self.profile.render_request(payload);

        let write_ok = match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(request.as_bytes()).await.is_ok()
                    && stdin.flush().await.is_ok()
            }
            None => false,
        };
        if !write_ok {
            self.dispose().await;
            return ExecOutcome {
                result: TaskResult::faulted(
                    REASON_PROCESS_EXITED,
                    String::new(),
                    started.elapsed(),
                ),
                worker_alive: false,
            };
        }

        let mut reader = match self.stdout.take() {
            Some(reader) => reader,
            None => {
                self.dispose().await;
                return ExecOutcome {
                    result: TaskResult::faulted(
                        REASON_PROCESS_EXITED,
                        String::new(),
                        started.elapsed(),
                    ),
                    worker_alive: false,
                };
            }
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut collected = String::new();
        loop {
            match tokio::time::timeout_at(deadline, reader.next_line()).await {
                Err(_) => {
                    self.dispose().await;
                    return ExecOutcome {
                        result: TaskResult::faulted(REASON_TIMEOUT, collected, started.elapsed()),
                        worker_alive: false,
                    };
                }
                Ok(Ok(Some(line))) => {
                    if let Some(code) = line.strip_prefix(END_MARKER) {
                        let exit_code = code.trim().parse::<i32>().unwrap_or(-1);
                        self.stdout = Some(reader);
                        return ExecOutcome {
                            result: TaskResult::from_exit(collected, exit_code, started.elapsed()),
                            worker_alive: true,
                        };
                    }
                    if let Ok(mut ring) = self.output.lock() {
                        ring.push(line.clone());
                    }
                    collected.push_str(&line);
                    collected.push('\n');
                }
                Ok(Ok(None)) | Ok(Err(_)) => {
                    self.dispose().await;
                    return ExecOutcome {
                        result: TaskResult::faulted(
                            REASON_PROCESS_EXITED,
                            collected,
                            started.elapsed(),
                        ),
                        worker_alive: false,
                    };
                }
            }
        }
    }

    /// Stop the worker: close stdin as a polite termination signal, wait
    /// up to `grace` for the child to exit, then kill it. Idempotent.
    pub async fn stop(&mut self, grace: Duration) {
        self.stdin.take();
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }

    /// Kill the child immediately and drop the I/O streams.
    async fn dispose(&mut self) {
        self.stdin.take();
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }

    /// Cheap liveness check: true while the child process is running.
    pub fn health_probe(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// The most recent `count` output lines.
    pub fn recent_output(&self, count: usize) -> Vec<String> {
        self.output
            .lock()
            .map(|ring| ring.tail(count))
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("program", &self.profile.program)
            .field("alive", &self.child.is_some())
            .finish()
    }
}
