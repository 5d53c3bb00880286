//! Enqueue/dequeue and the guarded status transitions.
//!
//! Every status change goes through a `mark_*` method whose UPDATE carries the
//! expected current state in its WHERE clause. `mark_processing` is the only
//! claim mechanism: whoever flips PENDING → IN_PROGRESS owns the attempt, no
//! matter how many processes share the database.

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use super::hosts;
use super::models::{
    cutoff_secs_ago, format_timestamp, DecodedPayload, Direction, MessageStatus, NewQueueMessage, QueueMessage,
};
use super::{enum_column, optional_timestamp_column, timestamp_column};
use crate::config::RetryConfig;
use crate::error::{QueueError, QueueResult};

pub(crate) const MESSAGE_COLUMNS: &str = "id, message_id, host_id, direction, message_type, \
     message_data, status, priority, retry_count, max_retries, created_at, started_at, sent_at, \
     completed_at, scheduled_at, expired_at, last_error_at, error_message, correlation_id, reply_to";

/// URGENT > HIGH > NORMAL > LOW.
const PRIORITY_RANK: &str = "CASE priority WHEN 'urgent' THEN 3 WHEN 'high' THEN 2 \
     WHEN 'normal' THEN 1 ELSE 0 END";

/// PENDING, not expired, and not held back by `scheduled_at`. Binds `?1` = now.
const DISPATCHABLE: &str = "status = 'pending' AND expired_at IS NULL \
     AND (scheduled_at IS NULL OR scheduled_at <= ?1)";

/// How many times `mark_failed` re-reads a row that changed under it.
const MARK_FAILED_ATTEMPTS: usize = 3;

fn window_secs(secs: u64) -> QueueResult<i64> {
    i64::try_from(secs).map_err(|_| QueueError::invalid(format!("age window {secs}s is out of range")))
}

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueMessage> {
    Ok(QueueMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        host_id: row.get(2)?,
        direction: enum_column(row, 3)?,
        message_type: row.get(4)?,
        message_data: row.get(5)?,
        status: enum_column(row, 6)?,
        priority: enum_column(row, 7)?,
        retry_count: row.get(8)?,
        max_retries: row.get(9)?,
        created_at: timestamp_column(row, 10)?,
        started_at: optional_timestamp_column(row, 11)?,
        sent_at: optional_timestamp_column(row, 12)?,
        completed_at: optional_timestamp_column(row, 13)?,
        scheduled_at: optional_timestamp_column(row, 14)?,
        expired_at: optional_timestamp_column(row, 15)?,
        last_error_at: optional_timestamp_column(row, 16)?,
        error_message: row.get(17)?,
        correlation_id: row.get(18)?,
        reply_to: row.get(19)?,
    })
}

/// Decode a row's payload. Never fails: a malformed payload is logged and
/// reported as `DecodedPayload::Malformed`, so one corrupt row cannot stall a cycle.
pub fn deserialize_message_data(message: &QueueMessage) -> DecodedPayload {
    let decoded = DecodedPayload::decode(message.message_data.as_deref());
    if let DecodedPayload::Malformed { error } = &decoded {
        tracing::warn!(
            "Malformed payload on message {} ({}): {error}",
            message.message_id,
            message.message_type
        );
    }
    decoded
}

/// Queue operations bound to one connection or transaction.
pub struct QueueOps<'c> {
    conn: &'c Connection,
    retry: &'c RetryConfig,
}

impl<'c> QueueOps<'c> {
    pub fn new(conn: &'c Connection, retry: &'c RetryConfig) -> Self {
        Self { conn, retry }
    }

    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    pub(super) fn query_messages(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> QueueResult<Vec<QueueMessage>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Insert a PENDING row and return its `message_id`.
    ///
    /// Fails with `HostNotFound` if `host_id` is given but unknown, and with
    /// `InvalidArgument` for an empty type, a non-object payload, a negative
    /// retry budget or a duplicate `message_id`. No row is written on failure.
    pub fn enqueue_message(&self, msg: &NewQueueMessage) -> QueueResult<String> {
        if msg.message_type.trim().is_empty() {
            return Err(QueueError::invalid("message_type must not be empty"));
        }
        if !(msg.payload.is_object() || msg.payload.is_null()) {
            return Err(QueueError::invalid("payload must be a JSON object"));
        }
        let max_retries = msg.max_retries.unwrap_or(self.retry.default_max_retries);
        if max_retries < 0 {
            return Err(QueueError::invalid("max_retries must not be negative"));
        }
        if let Some(host_id) = msg.host_id.as_deref() {
            if hosts::get_host(self.conn, host_id)?.is_none() {
                return Err(QueueError::HostNotFound(host_id.to_string()));
            }
        }

        let message_id = match msg.message_id.as_deref() {
            Some(id) if id.trim().is_empty() => {
                return Err(QueueError::invalid("message_id must not be empty"));
            }
            Some(id) => id.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let message_data = if msg.payload.is_null() {
            None
        } else {
            Some(serde_json::to_string(&msg.payload)?)
        };

        self.conn
            .execute(
                "INSERT INTO queue_messages (message_id, host_id, direction, message_type, \
                 message_data, status, priority, retry_count, max_retries, created_at, \
                 scheduled_at, correlation_id, reply_to)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7, ?8, ?9, ?10, ?11)",
                params![
                    message_id,
                    msg.host_id,
                    msg.direction.as_str(),
                    msg.message_type,
                    message_data,
                    msg.priority.as_str(),
                    max_retries,
                    format_timestamp(Utc::now()),
                    msg.scheduled_at.map(format_timestamp),
                    msg.correlation_id,
                    msg.reply_to,
                ],
            )
            .map_err(|e| match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => {
                    QueueError::invalid(format!("message_id '{message_id}' already exists"))
                }
                _ => QueueError::from(e),
            })?;

        tracing::debug!(
            "Enqueued {} message {} ({}) for host {:?}",
            msg.direction,
            message_id,
            msg.message_type,
            msg.host_id
        );
        Ok(message_id)
    }

    pub fn get_message(&self, message_id: &str) -> QueueResult<Option<QueueMessage>> {
        let message = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM queue_messages WHERE message_id = ?1"),
                params![message_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Dispatchable rows for one host. With `priority_order`, URGENT first and
    /// oldest first within a priority; otherwise strict FIFO. Non-destructive.
    pub fn dequeue_messages_for_host(
        &self,
        host_id: &str,
        direction: Direction,
        limit: usize,
        priority_order: bool,
    ) -> QueueResult<Vec<QueueMessage>> {
        let order = if priority_order {
            format!("{PRIORITY_RANK} DESC, created_at ASC, id ASC")
        } else {
            "created_at ASC, id ASC".to_string()
        };
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM queue_messages
                 WHERE {DISPATCHABLE} AND host_id = ?2 AND direction = ?3
                 ORDER BY {order} LIMIT ?4"
            ),
            params![
                format_timestamp(Utc::now()),
                host_id,
                direction.as_str(),
                limit as i64
            ],
        )
    }

    /// Dispatchable rows with no host, strict FIFO.
    pub fn dequeue_broadcast_messages(
        &self,
        direction: Direction,
        limit: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM queue_messages
                 WHERE {DISPATCHABLE} AND host_id IS NULL AND direction = ?2
                 ORDER BY created_at ASC, id ASC LIMIT ?3"
            ),
            params![format_timestamp(Utc::now()), direction.as_str(), limit as i64],
        )
    }

    /// Dispatchable host-addressed outbound rows across all hosts, highest
    /// priority first, then oldest.
    pub fn dequeue_outbound_batch(&self, limit: usize) -> QueueResult<Vec<QueueMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM queue_messages
                 WHERE {DISPATCHABLE} AND host_id IS NOT NULL AND direction = 'outbound'
                 ORDER BY {PRIORITY_RANK} DESC, created_at ASC, id ASC LIMIT ?2"
            ),
            params![format_timestamp(Utc::now()), limit as i64],
        )
    }

    /// Distinct hosts with dispatchable rows, longest-waiting backlog first.
    pub fn hosts_with_pending(&self, direction: Direction, limit: usize) -> QueueResult<Vec<String>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT host_id FROM queue_messages
             WHERE {DISPATCHABLE} AND host_id IS NOT NULL AND direction = ?2
             GROUP BY host_id ORDER BY MIN(created_at) ASC, MIN(id) ASC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![format_timestamp(Utc::now()), direction.as_str(), limit as i64],
            |row| row.get::<_, String>(0),
        )?;
        let mut host_ids = Vec::new();
        for row in rows {
            host_ids.push(row?);
        }
        Ok(host_ids)
    }

    /// Claim a row: PENDING → IN_PROGRESS. Returns `false` if the row is
    /// missing, not PENDING, expired or not yet due, i.e. someone else won.
    pub fn mark_processing(&self, message_id: &str) -> QueueResult<bool> {
        let now = format_timestamp(Utc::now());
        let rows = self.conn.execute(
            &format!(
                "UPDATE queue_messages SET status = 'in_progress', started_at = ?1
                 WHERE message_id = ?2 AND {DISPATCHABLE}"
            ),
            params![now, message_id],
        )?;
        Ok(rows == 1)
    }

    /// Set COMPLETED. Repeating the call is a no-op that still returns `true`
    /// and keeps the original `completed_at`. FAILED rows are left alone.
    pub fn mark_completed(&self, message_id: &str) -> QueueResult<bool> {
        let rows = self.conn.execute(
            "UPDATE queue_messages
             SET completed_at = CASE WHEN status = 'completed' THEN completed_at ELSE ?1 END,
                 status = 'completed', started_at = NULL
             WHERE message_id = ?2 AND status <> 'failed'",
            params![format_timestamp(Utc::now()), message_id],
        )?;
        Ok(rows == 1)
    }

    /// Outbound IN_PROGRESS → SENT: handed to the transport, awaiting an ack.
    pub fn mark_sent(&self, message_id: &str) -> QueueResult<bool> {
        let rows = self.conn.execute(
            "UPDATE queue_messages SET status = 'sent', sent_at = ?1, started_at = NULL
             WHERE message_id = ?2 AND status = 'in_progress' AND direction = 'outbound'",
            params![format_timestamp(Utc::now()), message_id],
        )?;
        Ok(rows == 1)
    }

    /// SENT → COMPLETED once the correlated result arrives from `host_id`, the
    /// host the command was addressed to. A repeated ack for an
    /// already-completed row returns `true`; an ack from any other host is refused.
    pub fn mark_acknowledged(&self, message_id: &str, host_id: &str) -> QueueResult<bool> {
        let rows = self.conn.execute(
            "UPDATE queue_messages SET status = 'completed', completed_at = ?1
             WHERE message_id = ?2 AND host_id = ?3
               AND direction = 'outbound' AND status = 'sent'",
            params![format_timestamp(Utc::now()), message_id, host_id],
        )?;
        if rows == 1 {
            return Ok(true);
        }
        Ok(self.get_message(message_id)?.is_some_and(|m| {
            m.status == MessageStatus::Completed
                && m.direction == Direction::Outbound
                && m.host_id.as_deref() == Some(host_id)
        }))
    }

    /// Record a failed attempt.
    ///
    /// Increments `retry_count`. With `retry` and budget left the row goes back
    /// to PENDING, scheduled after the capped exponential backoff; otherwise it
    /// becomes terminal FAILED. Returns `false` for missing or terminal rows.
    pub fn mark_failed(
        &self,
        message_id: &str,
        error_message: Option<&str>,
        retry: bool,
    ) -> QueueResult<bool> {
        for _ in 0..MARK_FAILED_ATTEMPTS {
            let Some(current) = self.get_message(message_id)? else {
                return Ok(false);
            };
            if current.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now();
            let now_str = format_timestamp(now);
            let attempts = current.retry_count + 1;

            // Compare-and-set on (status, retry_count) so a concurrent writer
            // forces a re-read instead of a lost update.
            let rows = if retry && attempts < current.max_retries {
                let scheduled_at = now
                    .checked_add_signed(self.retry.backoff_for(attempts))
                    .map(format_timestamp)
                    .ok_or_else(|| QueueError::invalid("retry backoff is out of range"))?;
                self.conn.execute(
                    "UPDATE queue_messages
                     SET status = 'pending', retry_count = ?1, started_at = NULL, sent_at = NULL,
                         scheduled_at = ?2, last_error_at = ?3, error_message = ?4
                     WHERE message_id = ?5 AND status = ?6 AND retry_count = ?7",
                    params![
                        attempts,
                        scheduled_at,
                        now_str,
                        error_message,
                        message_id,
                        current.status.as_str(),
                        current.retry_count
                    ],
                )?
            } else {
                self.conn.execute(
                    "UPDATE queue_messages
                     SET status = 'failed', retry_count = ?1, started_at = NULL,
                         completed_at = ?2, last_error_at = ?2, error_message = ?3
                     WHERE message_id = ?4 AND status = ?5 AND retry_count = ?6",
                    params![
                        attempts,
                        now_str,
                        error_message,
                        message_id,
                        current.status.as_str(),
                        current.retry_count
                    ],
                )?
            };

            if rows == 1 {
                if retry && attempts < current.max_retries {
                    tracing::warn!(
                        "Message {message_id} failed (attempt {attempts}/{}), retry scheduled: {}",
                        current.max_retries,
                        error_message.unwrap_or("no reason given")
                    );
                } else {
                    tracing::error!(
                        "Message {message_id} permanently failed after {attempts} attempt(s): {}",
                        error_message.unwrap_or("no reason given")
                    );
                }
                return Ok(true);
            }
        }

        tracing::warn!("Message {message_id} kept changing while marking it failed, giving up");
        Ok(false)
    }

    /// Requeue SENT rows whose ack has not arrived within `timeout_secs`.
    /// Each goes through `mark_failed(retry = true)`, so the retry budget applies.
    pub fn retry_unacknowledged_messages(&self, timeout_secs: u64) -> QueueResult<usize> {
        let cutoff = cutoff_secs_ago(Utc::now(), window_secs(timeout_secs)?)?;
        let mut stmt = self.conn.prepare(
            "SELECT message_id FROM queue_messages
             WHERE status = 'sent' AND sent_at < ?1 ORDER BY sent_at ASC",
        )?;
        let ids = stmt
            .query_map(params![format_timestamp(cutoff)], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let reason = format!("no acknowledgement within {timeout_secs}s");
        let mut requeued = 0;
        for id in ids {
            if self.mark_failed(&id, Some(&reason), true)? {
                requeued += 1;
            }
        }
        if requeued > 0 {
            tracing::info!("Requeued {requeued} unacknowledged message(s)");
        }
        Ok(requeued)
    }

    /// Reset IN_PROGRESS rows claimed more than `threshold_secs` ago back to
    /// PENDING. Recovers claims left behind by a cycle that died mid-flight.
    pub fn reset_stuck_messages(&self, direction: Direction, threshold_secs: u64) -> QueueResult<usize> {
        let cutoff = cutoff_secs_ago(Utc::now(), window_secs(threshold_secs)?)?;
        let rows = self.conn.execute(
            "UPDATE queue_messages SET status = 'pending', started_at = NULL
             WHERE status = 'in_progress' AND direction = ?1 AND started_at < ?2",
            params![direction.as_str(), format_timestamp(cutoff)],
        )?;
        if rows > 0 {
            tracing::warn!("Reset {rows} stuck {direction} message(s) to pending");
        }
        Ok(rows)
    }
}
