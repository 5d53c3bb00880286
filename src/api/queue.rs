use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::server::{err_json, ok_json, queue_err_to_response, with_store, ApiResponse, ApiState};
use crate::db::{deserialize_message_data, Direction, NewQueueMessage, Priority, QueueMessage};
use crate::error::QueueError;

const DEFAULT_FAILED_LIMIT: usize = 50;
const MAX_FAILED_LIMIT: usize = 500;

/// Row as returned to operators: the stored columns plus the decoded payload.
fn message_json(message: &QueueMessage) -> serde_json::Value {
    let mut value = serde_json::to_value(message).unwrap_or_else(|_| serde_json::json!({}));
    if let Some(obj) = value.as_object_mut() {
        let payload = deserialize_message_data(message).into_map();
        obj.insert("payload".into(), serde_json::Value::Object(payload));
    }
    value
}

fn parse_direction(raw: Option<&str>) -> Result<Option<Direction>, ApiResponse> {
    raw.map(|d| {
        d.parse::<Direction>()
            .map_err(|e| err_json(StatusCode::BAD_REQUEST, &e.to_string()))
    })
    .transpose()
}

// ── Enqueue ──────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct EnqueueBody {
    pub message_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub host_id: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub message_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

fn default_direction() -> Direction {
    Direction::Outbound
}

impl EnqueueBody {
    fn into_message(self) -> NewQueueMessage {
        let mut msg = NewQueueMessage::new(self.message_type, self.payload, self.direction)
            .with_priority(self.priority);
        msg.host_id = self.host_id;
        msg.message_id = self.message_id;
        msg.scheduled_at = self.scheduled_at;
        msg.max_retries = self.max_retries;
        msg.correlation_id = self.correlation_id;
        msg.reply_to = self.reply_to;
        msg
    }
}

/// POST /api/queue/messages
pub async fn handle_enqueue(
    State(state): State<ApiState>,
    Json(body): Json<EnqueueBody>,
) -> ApiResponse {
    let msg = body.into_message();
    with_store(&state.store, move |store| {
        let message_id = store.enqueue_message(&msg).map_err(|e| {
            if e.is_validation() {
                tracing::debug!("Rejected enqueue: {e}");
            }
            queue_err_to_response(e)
        })?;
        tracing::info!(
            "Enqueued {} {} message {message_id}",
            msg.direction,
            msg.message_type
        );
        Ok((
            StatusCode::CREATED,
            Json(serde_json::json!({
                "message_id": message_id,
                "status": "pending",
            })),
        ))
    })
    .await
}

/// GET /api/queue/messages/:message_id
pub async fn handle_get_message(
    State(state): State<ApiState>,
    AxumPath(message_id): AxumPath<String>,
) -> ApiResponse {
    with_store(&state.store, move |store| {
        match store.get_message(&message_id).map_err(queue_err_to_response)? {
            Some(message) => Ok(ok_json(message_json(&message))),
            None => Err(queue_err_to_response(QueueError::MessageNotFound(message_id))),
        }
    })
    .await
}

// ── Stats / failed ───────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StatsQuery {
    pub host_id: Option<String>,
    pub direction: Option<String>,
}

/// GET /api/queue/stats
pub async fn handle_stats(
    State(state): State<ApiState>,
    Query(query): Query<StatsQuery>,
) -> ApiResponse {
    let direction = match parse_direction(query.direction.as_deref()) {
        Ok(d) => d,
        Err(resp) => return resp,
    };
    with_store(&state.store, move |store| {
        let stats = store
            .get_queue_stats(query.host_id.as_deref(), direction)
            .map_err(queue_err_to_response)?;
        Ok(ok_json(serde_json::json!({
            "host_id": query.host_id,
            "direction": direction,
            "stats": stats,
        })))
    })
    .await
}

#[derive(Deserialize)]
pub struct FailedQuery {
    pub limit: Option<usize>,
}

/// GET /api/queue/failed
pub async fn handle_list_failed(
    State(state): State<ApiState>,
    Query(query): Query<FailedQuery>,
) -> ApiResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_FAILED_LIMIT)
        .clamp(1, MAX_FAILED_LIMIT);
    with_store(&state.store, move |store| {
        let failed = store
            .get_failed_messages(limit)
            .map_err(queue_err_to_response)?;
        let messages: Vec<serde_json::Value> = failed.iter().map(message_json).collect();
        Ok(ok_json(serde_json::json!({
            "count": messages.len(),
            "messages": messages,
        })))
    })
    .await
}

#[derive(Deserialize)]
pub struct DeleteFailedBody {
    pub ids: Vec<String>,
}

/// POST /api/queue/failed/delete
pub async fn handle_delete_failed(
    State(state): State<ApiState>,
    Json(body): Json<DeleteFailedBody>,
) -> ApiResponse {
    if body.ids.is_empty() {
        return err_json(StatusCode::BAD_REQUEST, "ids must not be empty");
    }
    with_store(&state.store, move |store| {
        let deleted = store
            .delete_failed_messages(&body.ids)
            .map_err(queue_err_to_response)?;
        tracing::info!("Deleted {deleted} failed message(s) on operator request");
        Ok(ok_json(serde_json::json!({ "deleted": deleted })))
    })
    .await
}

// ── Retention ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CleanupBody {
    pub older_than_days: Option<i64>,
    pub keep_failed: Option<bool>,
}

/// POST /api/queue/cleanup
pub async fn handle_cleanup(
    State(state): State<ApiState>,
    Json(body): Json<CleanupBody>,
) -> ApiResponse {
    let days = body
        .older_than_days
        .unwrap_or(state.retention.cleanup_after_days);
    if days <= 0 {
        return err_json(StatusCode::BAD_REQUEST, "older_than_days must be greater than 0");
    }
    let keep_failed = body.keep_failed.unwrap_or(state.retention.keep_failed);
    let metrics = state.metrics.clone();

    with_store(&state.store, move |store| {
        let deleted = store
            .cleanup_old_messages(days, keep_failed)
            .map_err(queue_err_to_response)?;
        metrics.record_purged(deleted);
        tracing::info!("Cleanup removed {deleted} message(s) older than {days} day(s)");
        Ok(ok_json(serde_json::json!({
            "deleted": deleted,
            "older_than_days": days,
            "keep_failed": keep_failed,
        })))
    })
    .await
}

/// DELETE /api/hosts/:host_id/messages
pub async fn handle_purge_host(
    State(state): State<ApiState>,
    AxumPath(host_id): AxumPath<String>,
) -> ApiResponse {
    let metrics = state.metrics.clone();
    with_store(&state.store, move |store| {
        let deleted = store
            .delete_messages_for_host(&host_id)
            .map_err(queue_err_to_response)?;
        metrics.record_purged(deleted);
        tracing::info!("Purged {deleted} message(s) for host {host_id}");
        Ok(ok_json(serde_json::json!({
            "host_id": host_id,
            "deleted": deleted,
        })))
    })
    .await
}
