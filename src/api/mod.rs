//! Admin REST endpoints for the task queue.
//!
//! Read and administrative operations only; execution always goes through
//! the claim protocol.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::TaskStore;
use crate::tasks::{NewTask, Routing, TaskContext, TaskFilter, TaskStatus};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
}

type ApiResponse = (StatusCode, Json<serde_json::Value>);

/// Build the Axum router with the task admin routes.
pub fn task_routes(store: Arc<dyn TaskStore>) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/stats", get(task_stats))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/approve", post(approve_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(3600))
}

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "error": message })))
}

fn internal(op: &str, e: DatabaseError) -> ApiResponse {
    error!(op, error = %e, "Task API store error");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal store error")
}

fn parse_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

/// 404 unless the task exists.
async fn require_task(state: &AppState, id: Uuid) -> Result<(), ApiResponse> {
    match state.store.get_task(id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => Err(internal("get_task", e)),
    }
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ai-delegate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Tasks ───────────────────────────────────────────────────────────────

async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskFilter>,
) -> Result<ApiResponse, ApiResponse> {
    let tasks = state
        .store
        .list_tasks(&filter)
        .await
        .map_err(|e| internal("list_tasks", e))?;
    Ok((StatusCode::OK, Json(json!(tasks))))
}

/// Body for `POST /api/tasks`. Origin defaults to the `api` channel.
#[derive(Debug, Deserialize)]
struct EnqueueRequest {
    agent: String,
    input: String,
    #[serde(default)]
    context: Option<TaskContext>,
    #[serde(default)]
    origin_channel: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    origin_message_id: Option<String>,
    #[serde(default)]
    origin_user_id: Option<String>,
    #[serde(default)]
    max_attempts: Option<u32>,
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<EnqueueRequest>,
) -> Result<ApiResponse, ApiResponse> {
    if body.agent.trim().is_empty() || body.input.trim().is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "agent and input are required",
        ));
    }

    let new = NewTask {
        agent: body.agent.trim().to_string(),
        input: body.input,
        context: body.context,
        routing: Routing {
            origin_channel: body.origin_channel.unwrap_or_else(|| "api".into()),
            session_id: body.session_id.unwrap_or_else(|| "api".into()),
            origin_message_id: body.origin_message_id,
            origin_user_id: body.origin_user_id,
        },
        max_attempts: body.max_attempts,
    };

    let task = state
        .store
        .create_task(&new)
        .await
        .map_err(|e| internal("create_task", e))?;
    info!(task_id = %task.id, agent = %task.agent, "Task enqueued via API");
    Ok((StatusCode::CREATED, Json(json!(task))))
}

async fn task_stats(State(state): State<AppState>) -> Result<ApiResponse, ApiResponse> {
    let stats = state
        .store
        .stats()
        .await
        .map_err(|e| internal("stats", e))?;
    Ok((
        StatusCode::OK,
        Json(json!({
            "pending": stats.pending,
            "running": stats.running,
            "completed": stats.completed,
            "failed": stats.failed,
            "cancelled": stats.cancelled,
            "total": stats.total(),
            "notify_pending": stats.notify_pending,
            "notify_failed": stats.notify_failed,
        })),
    ))
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id)?;
    match state.store.get_task(id).await {
        Ok(Some(task)) => Ok((StatusCode::OK, Json(json!(task)))),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Task not found")),
        Err(e) => Err(internal("get_task", e)),
    }
}

/// Record the orchestrator's acknowledgement for one task.
async fn approve_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id)?;
    require_task(&state, id).await?;

    let changed = state
        .store
        .mark_ack_sent(&[id])
        .await
        .map_err(|e| internal("mark_ack_sent", e))?;
    Ok((
        StatusCode::OK,
        Json(json!({ "status": "approved", "changed": changed })),
    ))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id)?;
    require_task(&state, id).await?;

    let cancelled = state
        .store
        .cancel_task(id)
        .await
        .map_err(|e| internal("cancel_task", e))?;
    if cancelled {
        Ok((StatusCode::OK, Json(json!({ "status": TaskStatus::Cancelled }))))
    } else {
        Err(error_response(
            StatusCode::CONFLICT,
            "Task is not pending or running",
        ))
    }
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<ApiResponse, ApiResponse> {
    let id = parse_id(&id)?;
    require_task(&state, id).await?;

    let retried = state
        .store
        .retry_task(id)
        .await
        .map_err(|e| internal("retry_task", e))?;
    if retried {
        Ok((StatusCode::OK, Json(json!({ "status": TaskStatus::Pending }))))
    } else {
        Err(error_response(
            StatusCode::CONFLICT,
            "Only a failed task can be retried, and only once",
        ))
    }
}
