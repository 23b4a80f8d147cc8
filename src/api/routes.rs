//! REST surface: a thin translation layer over the orchestrator.
//!
//! Handlers validate request bodies, delegate to the orchestrator, and
//! map the error taxonomy onto HTTP status codes: `400` for invalid
//! input, cycles, and workflow validation, `404` for unknown ids, `409`
//! for capacity, `500` otherwise.

use crate::core::task::{TaskId, TaskPayload, TaskPriority, TaskRequest, TaskState};
use crate::error::Error;
use crate::orchestration::orchestrator::Orchestrator;
use crate::orchestration::worker::WorkerId;
use crate::workflow::{WorkflowDocument, WorkflowExecutor, WorkflowId};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the full REST/WebSocket router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/instances", get(list_instances))
        .route("/instances/spawn", post(spawn_instances))
        .route("/instances/scale", post(scale_instances))
        .route("/instances/{id}", get(get_instance).delete(delete_instance))
        .route("/instances/{id}/output", get(instance_output))
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/tasks/batch", post(submit_batch))
        .route("/tasks/clear-completed", post(clear_completed))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/workflows/execute", post(execute_workflow))
        .route("/ws/stream", get(crate::api::ws::stream))
        .with_state(state)
}

/// Error wrapper mapping the crate taxonomy onto HTTP status codes.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_)
            | Error::CycleDetected { .. }
            | Error::WorkflowInvalid(_)
            | Error::Yaml(_) => StatusCode::BAD_REQUEST,
            Error::UnknownTask(_) | Error::UnknownWorker(_) => StatusCode::NOT_FOUND,
            Error::CapacityExceeded { .. } => StatusCode::CONFLICT,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ---- Liveness and status ----

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.status().await)
}

// ---- Instances ----

#[derive(Debug, Deserialize)]
struct SpawnBody {
    count: usize,
    #[serde(default)]
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SpawnResponse {
    worker_ids: Vec<WorkerId>,
}

async fn spawn_instances(
    State(state): State<AppState>,
    Json(body): Json<SpawnBody>,
) -> ApiResult<Json<SpawnResponse>> {
    if body.count == 0 {
        return Err(Error::Validation("count must be at least 1".to_string()).into());
    }
    let worker_ids = state
        .orchestrator
        .spawn_instances(body.count, body.working_directory)
        .await?;
    Ok(Json(SpawnResponse { worker_ids }))
}

async fn list_instances(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.instances().await)
}

async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
) -> ApiResult<Response> {
    Ok(Json(state.orchestrator.instance(id).await?).into_response())
}

#[derive(Debug, Serialize)]
struct TerminateResponse {
    terminated: bool,
}

async fn delete_instance(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
) -> ApiResult<Json<TerminateResponse>> {
    state.orchestrator.terminate_instance(id).await?;
    Ok(Json(TerminateResponse { terminated: true }))
}

#[derive(Debug, Deserialize)]
struct OutputQuery {
    #[serde(default = "default_output_lines")]
    lines: usize,
}

fn default_output_lines() -> usize {
    50
}

#[derive(Debug, Serialize)]
struct OutputResponse {
    lines: Vec<String>,
}

async fn instance_output(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<Json<OutputResponse>> {
    let lines = state.orchestrator.instance_output(id, query.lines).await?;
    Ok(Json(OutputResponse { lines }))
}

#[derive(Debug, Deserialize)]
struct ScaleBody {
    target: usize,
}

#[derive(Debug, Serialize)]
struct ScaleResponse {
    current: usize,
}

async fn scale_instances(
    State(state): State<AppState>,
    Json(body): Json<ScaleBody>,
) -> ApiResult<Json<ScaleResponse>> {
    let current = state.orchestrator.scale(body.target).await;
    Ok(Json(ScaleResponse { current }))
}

// ---- Tasks ----

/// Submission body for a single task.
#[derive(Debug, Deserialize)]
struct TaskBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    directory: Option<PathBuf>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    depends_on: Vec<TaskId>,
    #[serde(default)]
    pinned_instance: Option<WorkerId>,
    /// Timeout in seconds.
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    name: Option<String>,
}

impl TaskBody {
    fn into_request(self) -> Result<TaskRequest, Error> {
        let payload = match (self.prompt, self.command) {
            (Some(_), Some(_)) => {
                return Err(Error::Validation(
                    "task has both prompt and command".to_string(),
                ))
            }
            (None, None) => {
                return Err(Error::Validation(
                    "task needs a prompt or a command".to_string(),
                ))
            }
            (Some(prompt), None) => {
                if self.directory.is_some() {
                    return Err(Error::Validation(
                        "directory is only valid with a command".to_string(),
                    ));
                }
                TaskPayload::Prompt { prompt }
            }
            (None, Some(command)) => TaskPayload::Command {
                command,
                working_directory: self.directory,
            },
        };
        Ok(TaskRequest {
            name: self.name,
            payload,
            priority: self.priority.unwrap_or_default(),
            depends_on: self.depends_on,
            pinned_worker: self.pinned_instance,
            timeout: self.timeout.map(Duration::from_secs),
        })
    }
}

#[derive(Debug, Serialize)]
struct TaskIdResponse {
    task_id: TaskId,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(body): Json<TaskBody>,
) -> ApiResult<Json<TaskIdResponse>> {
    let request = body.into_request()?;
    let task_id = state.orchestrator.submit(request).await?;
    Ok(Json(TaskIdResponse { task_id }))
}

#[derive(Debug, Serialize)]
struct TaskIdsResponse {
    task_ids: Vec<TaskId>,
}

async fn submit_batch(
    State(state): State<AppState>,
    Json(bodies): Json<Vec<TaskBody>>,
) -> ApiResult<Json<TaskIdsResponse>> {
    let mut requests = Vec::with_capacity(bodies.len());
    for body in bodies {
        requests.push(body.into_request()?);
    }
    let task_ids = state.orchestrator.submit_batch(requests).await?;
    Ok(Json(TaskIdsResponse { task_ids }))
}

#[derive(Debug, Deserialize)]
struct TasksQuery {
    #[serde(default)]
    state: Option<String>,
    #[serde(default = "default_task_limit")]
    limit: usize,
}

fn default_task_limit() -> usize {
    100
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Response> {
    let filter = match query.state.as_deref() {
        Some(raw) => Some(
            raw.parse::<TaskState>()
                .map_err(Error::Validation)?,
        ),
        None => None,
    };
    let tasks = state.orchestrator.tasks(filter, query.limit).await;
    Ok(Json(tasks).into_response())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Response> {
    Ok(Json(state.orchestrator.task(id).await?).into_response())
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<Json<CancelResponse>> {
    let cancelled = state.orchestrator.cancel(id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

#[derive(Debug, Serialize)]
struct ClearedResponse {
    cleared: usize,
}

async fn clear_completed(State(state): State<AppState>) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        cleared: state.orchestrator.clear_completed().await,
    })
}

// ---- Workflows ----

#[derive(Debug, Serialize)]
struct WorkflowResponse {
    workflow_id: WorkflowId,
    task_ids: Vec<TaskId>,
}

async fn execute_workflow(
    State(state): State<AppState>,
    Json(document): Json<WorkflowDocument>,
) -> ApiResult<Json<WorkflowResponse>> {
    let executor = WorkflowExecutor::new(Arc::clone(&state.orchestrator));
    let submitted = executor.submit_detached(&document).await?;
    Ok(Json(WorkflowResponse {
        workflow_id: submitted.workflow_id,
        task_ids: submitted.task_ids,
    }))
}
