//! REST facade of the Cloud Tasks emulator
//!
//! This module exposes the v2 HTTP/JSON mapping of the Cloud Tasks API plus
//! the OIDC discovery endpoints. Each public function corresponds to one API
//! method; custom methods (`:pause`, `:resume`, `:purge`, `:run`) arrive as
//! a colon suffix on the final path segment and are split off here.

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use shared::api::{
    CreateTaskRequest, ListQueuesResponse, ListTasksResponse, Queue, Task,
};
use shared::config::EmulatorConfig;
use shared::EmulatorError;
use std::sync::Arc;
use tracing::info;

use crate::oidc::OidcSigner;
use crate::registry::QueueRegistry;

/// Application state shared across all API handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<QueueRegistry>,
    pub signer: Arc<OidcSigner>,
    pub config: Arc<EmulatorConfig>,
}

/// Creates the main API router and defines all the application's routes.
pub fn create_router(state: AppState) -> Router {
    // Task bodies are small by contract; 10MB leaves generous headroom
    // while bounding memory per request.
    const MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

    let mut router = Router::new()
        // Liveness probe for scripts and container orchestrators.
        .route("/health", get(health_check))
        .route("/jwks", get(handle_jwks))
        .route(
            "/v2/projects/{project}/locations/{location}/queues",
            get(handle_list_queues).post(handle_create_queue),
        )
        .route(
            "/v2/projects/{project}/locations/{location}/queues/{queue}",
            get(handle_get_queue)
                .patch(handle_update_queue)
                .delete(handle_delete_queue)
                .post(handle_queue_method),
        )
        .route(
            "/v2/projects/{project}/locations/{location}/queues/{queue}/tasks",
            get(handle_list_tasks).post(handle_create_task),
        )
        .route(
            "/v2/projects/{project}/locations/{location}/queues/{queue}/tasks/{task}",
            get(handle_get_task)
                .delete(handle_delete_task)
                .post(handle_task_method),
        );

    // The discovery document is only served when an issuer is configured.
    if state.config.openid_issuer.is_some() {
        router = router.route("/.well-known/openid-configuration", get(handle_discovery));
    }

    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(state)
}

/// Client-facing API errors, mapped onto the google.rpc status vocabulary.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    Unimplemented(String),
    #[error("{0}")]
    Internal(String),
}

impl From<EmulatorError> for ApiError {
    fn from(error: EmulatorError) -> Self {
        match error {
            EmulatorError::InvalidArgument(msg) => ApiError::InvalidArgument(msg),
            EmulatorError::AlreadyExists(msg) => ApiError::AlreadyExists(msg),
            EmulatorError::NotFound(msg) => ApiError::NotFound(msg),
            EmulatorError::FailedPrecondition(msg) => ApiError::FailedPrecondition(msg),
            EmulatorError::Unimplemented(msg) => ApiError::Unimplemented(msg),
            EmulatorError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

/// Renders errors as the REST mapping of google.rpc.Status, so client
/// libraries surface them the same way the managed product would.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, rpc_status) = match self {
            ApiError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            ApiError::AlreadyExists(_) => (StatusCode::CONFLICT, "ALREADY_EXISTS"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::FailedPrecondition(_) => (StatusCode::BAD_REQUEST, "FAILED_PRECONDITION"),
            ApiError::Unimplemented(_) => (StatusCode::NOT_IMPLEMENTED, "UNIMPLEMENTED"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "status": rpc_status,
            }
        }));

        (status, body).into_response()
    }
}

fn queue_path(project: &str, location: &str, queue: &str) -> String {
    format!(
        "projects/{}/locations/{}/queues/{}",
        project, location, queue
    )
}

/// The handler for the `/health` endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "cloud-tasks-emulator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn handle_jwks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.signer.jwks())
}

async fn handle_discovery(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.signer.discovery_document())
}

async fn handle_create_queue(
    State(state): State<AppState>,
    Path((project, location)): Path<(String, String)>,
    Json(queue): Json<Queue>,
) -> Result<Json<Queue>, ApiError> {
    let parent = format!("projects/{}/locations/{}", project, location);
    info!(queue = %queue.name, "CreateQueue");
    let created = state.registry.create_queue(&parent, queue).await?;
    Ok(Json(created))
}

async fn handle_list_queues(
    State(state): State<AppState>,
    Path((project, location)): Path<(String, String)>,
) -> Result<Json<ListQueuesResponse>, ApiError> {
    let parent = format!("projects/{}/locations/{}", project, location);
    let queues = state.registry.list_queues(&parent).await?;
    Ok(Json(ListQueuesResponse { queues }))
}

async fn handle_get_queue(
    State(state): State<AppState>,
    Path((project, location, queue)): Path<(String, String, String)>,
) -> Result<Json<Queue>, ApiError> {
    let name = queue_path(&project, &location, &queue);
    let queue = state.registry.get_queue(&name).await?;
    Ok(Json(queue))
}

async fn handle_update_queue(
    State(_state): State<AppState>,
    Path((_project, _location, _queue)): Path<(String, String, String)>,
) -> Result<Json<Queue>, ApiError> {
    Err(ApiError::Unimplemented(
        "UpdateQueue is not supported by the emulator".to_string(),
    ))
}

async fn handle_delete_queue(
    State(state): State<AppState>,
    Path((project, location, queue)): Path<(String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = queue_path(&project, &location, &queue);
    info!(queue = %name, "DeleteQueue");
    state.registry.delete_queue(&name).await?;
    Ok(Json(serde_json::json!({})))
}

/// POST on a queue resource carries a custom method as a colon suffix:
/// `.../queues/q:pause`, `:resume` or `:purge`.
async fn handle_queue_method(
    State(state): State<AppState>,
    Path((project, location, queue_and_method)): Path<(String, String, String)>,
) -> Result<Json<Queue>, ApiError> {
    let Some((queue, method)) = queue_and_method.split_once(':') else {
        return Err(ApiError::NotFound(format!(
            "no POST method on queue '{}'",
            queue_and_method
        )));
    };
    let name = queue_path(&project, &location, queue);
    info!(queue = %name, method, "Queue custom method");
    let queue = match method {
        "pause" => state.registry.pause_queue(&name).await?,
        "resume" => state.registry.resume_queue(&name).await?,
        "purge" => state.registry.purge_queue(&name).await?,
        other => {
            return Err(ApiError::InvalidArgument(format!(
                "unknown queue method '{}'",
                other
            )))
        }
    };
    Ok(Json(queue))
}

async fn handle_create_task(
    State(state): State<AppState>,
    Path((project, location, queue)): Path<(String, String, String)>,
    Json(request): Json<CreateTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let queue_name = queue_path(&project, &location, &queue);
    let task = state.registry.create_task(&queue_name, request.task).await?;
    info!(task = %task.name, "CreateTask");
    Ok(Json(task))
}

async fn handle_list_tasks(
    State(state): State<AppState>,
    Path((project, location, queue)): Path<(String, String, String)>,
) -> Result<Json<ListTasksResponse>, ApiError> {
    let queue_name = queue_path(&project, &location, &queue);
    let tasks = state.registry.list_tasks(&queue_name).await?;
    Ok(Json(ListTasksResponse { tasks }))
}

async fn handle_get_task(
    State(state): State<AppState>,
    Path((project, location, queue, task)): Path<(String, String, String, String)>,
) -> Result<Json<Task>, ApiError> {
    let task_name = format!("{}/tasks/{}", queue_path(&project, &location, &queue), task);
    let task = state.registry.get_task(&task_name).await?;
    Ok(Json(task))
}

async fn handle_delete_task(
    State(state): State<AppState>,
    Path((project, location, queue, task)): Path<(String, String, String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let task_name = format!("{}/tasks/{}", queue_path(&project, &location, &queue), task);
    info!(task = %task_name, "DeleteTask");
    state.registry.delete_task(&task_name).await?;
    Ok(Json(serde_json::json!({})))
}

/// POST on a task resource carries `:run` as a colon suffix.
async fn handle_task_method(
    State(state): State<AppState>,
    Path((project, location, queue, task_and_method)): Path<(String, String, String, String)>,
) -> Result<Json<Task>, ApiError> {
    let Some((task, method)) = task_and_method.split_once(':') else {
        return Err(ApiError::NotFound(format!(
            "no POST method on task '{}'",
            task_and_method
        )));
    };
    let task_name = format!("{}/tasks/{}", queue_path(&project, &location, &queue), task);
    info!(task = %task_name, method, "Task custom method");
    match method {
        "run" => {
            let task = state.registry.run_task(&task_name).await?;
            Ok(Json(task))
        }
        other => Err(ApiError::InvalidArgument(format!(
            "unknown task method '{}'",
            other
        ))),
    }
}
