//! REST endpoints for queue monitoring and operator actions.

use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::context::ServiceContext;
use crate::error::QueueError;
use crate::queue::TaskState;

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// Shared state for admin routes.
#[derive(Clone)]
pub struct AdminState {
    pub ctx: Arc<ServiceContext>,
}

/// Build the admin router. Every `/api` route requires
/// `Authorization: Bearer <token>` when a token is configured.
pub fn admin_routes(ctx: Arc<ServiceContext>) -> Router {
    let expected: Option<Arc<str>> = ctx
        .config
        .admin_api
        .token
        .as_ref()
        .map(|t| Arc::from(format!("Bearer {}", t.expose_secret())));

    let api = Router::new()
        .route("/api/admin/stats", get(stats))
        .route("/api/admin/tasks", get(list_tasks))
        .route("/api/admin/tasks/{id}", get(get_task))
        .route("/api/admin/tasks/{id}/cancel", post(cancel_task))
        .route("/api/admin/tasks/{id}/retry", post(retry_task))
        .route("/api/admin/tasks/{id}/priority", post(set_priority))
        .route("/api/admin/users/{user_id}/pause", post(pause_user))
        .route("/api/admin/users/{user_id}/resume", post(resume_user))
        .route("/api/admin/backup", post(backup))
        .route_layer(middleware::from_fn(move |req: Request, next: Next| {
            let expected = expected.clone();
            async move { validate_bearer(expected, req, next).await }
        }));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(AdminState { ctx })
}

async fn validate_bearer(
    expected: Option<Arc<str>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = expected else {
        return Ok(next.run(req).await);
    };
    let auth = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if auth == Some(&*expected) {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({"error": message.into()}))).into_response()
}

fn queue_error(e: QueueError) -> Response {
    let status = match &e {
        QueueError::TaskNotFound { .. } => StatusCode::NOT_FOUND,
        QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
        QueueError::NotOwner { .. } => StatusCode::FORBIDDEN,
        QueueError::InvalidRange { .. } | QueueError::BatchTooLarge { .. } => {
            StatusCode::BAD_REQUEST
        }
        QueueError::LoginRequired => StatusCode::PRECONDITION_FAILED,
        QueueError::Store(_) | QueueError::Vault(_) => {
            tracing::error!(error = %e, "Admin request failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    error_response(status, e.to_string())
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid task ID"))
}

async fn health(State(state): State<AdminState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "save-restricted-bot",
        "running": state.ctx.engine.scheduler().running_count().await,
    }))
}

/// GET /api/admin/stats
async fn stats(State(state): State<AdminState>) -> Response {
    match state.ctx.engine.admin_stats().await {
        Ok(stats) => {
            let total = stats.total();
            let mut body = serde_json::json!(stats);
            body["total"] = total.into();
            Json(body).into_response()
        }
        Err(e) => queue_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    owner: Option<i64>,
    state: Option<String>,
    limit: Option<usize>,
}

/// GET /api/admin/tasks?owner=&state=&limit=
async fn list_tasks(State(state): State<AdminState>, Query(query): Query<ListQuery>) -> Response {
    let task_state = match query.state.as_deref().map(str::parse::<TaskState>) {
        None => None,
        Some(Ok(s)) => Some(s),
        Some(Err(_)) => {
            return error_response(StatusCode::BAD_REQUEST, "Unknown task state");
        }
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    match state
        .ctx
        .engine
        .list_tasks(query.owner, task_state, limit)
        .await
    {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => queue_error(e),
    }
}

/// GET /api/admin/tasks/{id}
async fn get_task(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.ctx.engine.get(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => queue_error(e),
    }
}

/// POST /api/admin/tasks/{id}/cancel
async fn cancel_task(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.ctx.engine.cancel(None, id).await {
        Ok(()) => Json(serde_json::json!({"id": id, "state": TaskState::Cancelled})).into_response(),
        Err(e) => queue_error(e),
    }
}

/// POST /api/admin/tasks/{id}/retry
async fn retry_task(State(state): State<AdminState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.ctx.engine.retry(id).await {
        Ok(()) => Json(serde_json::json!({"id": id, "state": TaskState::Pending})).into_response(),
        Err(e) => queue_error(e),
    }
}

#[derive(Debug, Deserialize)]
struct PriorityBody {
    priority: i64,
}

/// POST /api/admin/tasks/{id}/priority
async fn set_priority(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(body): Json<PriorityBody>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.ctx.engine.set_priority(id, body.priority).await {
        Ok(()) => Json(serde_json::json!({"id": id, "priority": body.priority})).into_response(),
        Err(e) => queue_error(e),
    }
}

/// POST /api/admin/users/{user_id}/pause
async fn pause_user(State(state): State<AdminState>, Path(user_id): Path<i64>) -> Response {
    let changed = state.ctx.engine.pause(user_id).await;
    Json(serde_json::json!({"user_id": user_id, "paused": true, "changed": changed}))
        .into_response()
}

/// POST /api/admin/users/{user_id}/resume
async fn resume_user(State(state): State<AdminState>, Path(user_id): Path<i64>) -> Response {
    let changed = state.ctx.engine.resume(user_id).await;
    Json(serde_json::json!({"user_id": user_id, "paused": false, "changed": changed}))
        .into_response()
}

/// POST /api/admin/backup
async fn backup(State(state): State<AdminState>) -> Response {
    match state.ctx.backups.create_backup().await {
        Ok(path) => Json(serde_json::json!({"path": path.display().to_string()})).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Backup request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
