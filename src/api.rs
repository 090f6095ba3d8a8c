use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::ProgressEngine;
use crate::error::EngineError;
use crate::events::ProgressEvent;

/// SSE event name every progress update is sent under.
pub const SSE_EVENT_NAME: &str = "taskUpdate";
const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ProgressEngine>,
}

impl AppState {
    pub fn new(engine: Arc<ProgressEngine>) -> Self {
        Self { engine }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/task-progress/:user_id", get(progress_stream))
        .route("/api/tasks/:user_id/start", post(start_task))
        .route("/api/tasks/:user_id/:task_id/cancel", post(cancel_task))
        .route("/api/users/active", get(active_users))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

// === Progress stream ===

async fn progress_stream(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get(LAST_EVENT_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty());

    let session = state
        .engine
        .open_stream(&user_id, last_event_id, CancellationToken::new());

    let stream = session
        .into_stream()
        .map(|event| Ok(sse_event(&event)));

    Sse::new(stream)
}

/// `id: <event_id>`, `event: taskUpdate`, `data: <json>`.
pub fn sse_event(event: &ProgressEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default()
        .id(event.event_id.as_str())
        .event(SSE_EVENT_NAME)
        .data(data)
}

// === Tasks ===

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartRequest {
    pub task_name: String,
    pub estimated_duration: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStartResponse {
    pub task_id: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUsersResponse {
    pub active_users: usize,
}

async fn start_task(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(req): Json<TaskStartRequest>,
) -> Result<Json<TaskStartResponse>, StatusCode> {
    match state
        .engine
        .start_task(&user_id, &req.task_name, req.estimated_duration)
    {
        Ok(task_id) => Ok(Json(TaskStartResponse {
            task_id,
            message: "Task started successfully".to_string(),
        })),
        Err(e) => Err(status_for(&e)),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path((user_id, task_id)): Path<(String, String)>,
) -> StatusCode {
    match state.engine.cancel_task(&user_id, &task_id) {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => status_for(&e),
    }
}

async fn active_users(State(state): State<AppState>) -> Json<ActiveUsersResponse> {
    Json(ActiveUsersResponse {
        active_users: state.engine.active_user_count(),
    })
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::TaskNotFound { .. } => {
            tracing::debug!("Request rejected ({}): {}", err.as_label(), err);
            StatusCode::NOT_FOUND
        }
        EngineError::ShuttingDown => {
            tracing::warn!("Request rejected ({}): {}", err.as_label(), err);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
