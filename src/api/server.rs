use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{extract::State, Json, Router};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::api::queue;
use crate::config::RetentionConfig;
use crate::db::QueueStore;
use crate::error::QueueError;
use crate::metrics::QueueMetrics;

/// Request bodies larger than this are rejected with 413.
const MAX_BODY_BYTES: usize = 256 * 1024; // 256 KiB

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state for every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<QueueStore>,
    pub metrics: QueueMetrics,
    pub retention: RetentionConfig,
}

/// JSON 404 for unknown API paths.
async fn handle_api_fallback() -> ApiResponse {
    err_json(StatusCode::NOT_FOUND, "Unknown API endpoint")
}

/// Build the router: operator API under `/api`, metrics at `/metrics`.
pub fn build_router(state: ApiState) -> Router {
    let api_router = Router::new()
        .route("/health", get(handle_health))
        .route("/queue/messages", post(queue::handle_enqueue))
        .route("/queue/messages/:message_id", get(queue::handle_get_message))
        .route("/queue/stats", get(queue::handle_stats))
        .route("/queue/failed", get(queue::handle_list_failed))
        .route("/queue/failed/delete", post(queue::handle_delete_failed))
        .route("/queue/cleanup", post(queue::handle_cleanup))
        .route("/hosts/:host_id/messages", delete(queue::handle_purge_host))
        .fallback(handle_api_fallback);

    Router::new()
        .route("/metrics", get(handle_metrics))
        .nest("/api", api_router)
        .fallback(handle_api_fallback)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

// ── Response helpers ─────────────────────────────────────────────

pub(crate) type ApiResponse = (StatusCode, Json<serde_json::Value>);

pub(crate) fn ok_json(value: serde_json::Value) -> ApiResponse {
    (StatusCode::OK, Json(value))
}

pub(crate) fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(serde_json::json!({ "error": message })))
}

pub(crate) fn queue_err_to_response(e: QueueError) -> ApiResponse {
    match &e {
        QueueError::HostNotFound(_) | QueueError::MessageNotFound(_) => {
            err_json(StatusCode::NOT_FOUND, &e.to_string())
        }
        QueueError::InvalidArgument(_) => err_json(StatusCode::BAD_REQUEST, &e.to_string()),
        QueueError::Database(_) | QueueError::Serialization(_) => {
            tracing::error!("Queue API error: {e}");
            err_json(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Run a store call on the blocking pool and turn the outcome into a response.
pub(crate) async fn with_store<F>(store: &Arc<QueueStore>, f: F) -> ApiResponse
where
    F: FnOnce(&QueueStore) -> Result<ApiResponse, ApiResponse> + Send + 'static,
{
    let store = store.clone();
    let result = tokio::task::spawn_blocking(move || f(&store)).await;

    match result {
        Ok(Ok(response)) | Ok(Err(response)) => response,
        Err(e) => err_json(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Task join error: {e}"),
        ),
    }
}

// ── Handlers ─────────────────────────────────────────────────────

async fn handle_health(State(state): State<ApiState>) -> ApiResponse {
    with_store(&state.store, |store| {
        store.health_check().map_err(|e| {
            tracing::error!("Health check failed: {e:#}");
            err_json(StatusCode::SERVICE_UNAVAILABLE, &format!("{e:#}"))
        })?;
        let stats = store.get_queue_stats(None, None).map_err(queue_err_to_response)?;
        Ok(ok_json(serde_json::json!({
            "status": "ok",
            "queue": stats,
        })))
    })
    .await
}

async fn handle_metrics(State(state): State<ApiState>) -> Response {
    match state.metrics.render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to render metrics: {e:#}");
            err_json(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics").into_response()
        }
    }
}
