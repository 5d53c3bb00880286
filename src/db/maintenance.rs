//! Expiry, purges and age-based cleanup.

use chrono::Utc;
use rusqlite::{params, params_from_iter};

use super::models::{cutoff_days_ago, cutoff_secs_ago, format_timestamp};
use super::QueueOps;
use crate::error::QueueResult;

impl QueueOps<'_> {
    /// Stamp `expired_at` on PENDING inbound rows older than `max_age_secs`.
    /// Expired rows stay for audit but are never dequeued again.
    pub fn expire_old_messages(&self, max_age_secs: i64) -> QueueResult<usize> {
        let now = Utc::now();
        let cutoff = cutoff_secs_ago(now, max_age_secs)?;
        let rows = self.conn().execute(
            "UPDATE queue_messages SET expired_at = ?1
             WHERE direction = 'inbound' AND status = 'pending'
               AND expired_at IS NULL AND created_at < ?2",
            params![format_timestamp(now), format_timestamp(cutoff)],
        )?;
        if rows > 0 {
            tracing::info!("Expired {rows} stale inbound message(s)");
        }
        Ok(rows)
    }

    /// Hard-delete COMPLETED rows (and FAILED ones unless `keep_failed`) that
    /// finished more than `older_than_days` ago, plus expired rows past the same age.
    pub fn cleanup_old_messages(&self, older_than_days: i64, keep_failed: bool) -> QueueResult<usize> {
        let cutoff = format_timestamp(cutoff_days_ago(Utc::now(), older_than_days)?);
        let statuses = if keep_failed {
            "('completed')"
        } else {
            "('completed', 'failed')"
        };
        let finished = self.conn().execute(
            &format!(
                "DELETE FROM queue_messages
                 WHERE status IN {statuses} AND COALESCE(completed_at, created_at) < ?1"
            ),
            params![cutoff],
        )?;
        let expired = self.conn().execute(
            "DELETE FROM queue_messages
             WHERE status = 'pending' AND expired_at IS NOT NULL AND expired_at < ?1",
            params![cutoff],
        )?;

        let total = finished + expired;
        if total > 0 {
            tracing::info!(
                "Cleaned up {total} message(s) older than {older_than_days} day(s) (keep_failed={keep_failed})"
            );
        }
        Ok(total)
    }

    /// Delete every row for `host_id`, any status or direction.
    pub fn delete_messages_for_host(&self, host_id: &str) -> QueueResult<usize> {
        let rows = self
            .conn()
            .execute("DELETE FROM queue_messages WHERE host_id = ?1", params![host_id])?;
        if rows > 0 {
            tracing::info!("Purged {rows} queued message(s) for host {host_id}");
        }
        Ok(rows)
    }

    /// Delete rows addressed to hosts that are no longer in the directory.
    pub fn purge_orphaned_messages(&self) -> QueueResult<usize> {
        let rows = self.conn().execute(
            "DELETE FROM queue_messages
             WHERE host_id IS NOT NULL
               AND NOT EXISTS (SELECT 1 FROM hosts WHERE hosts.id = queue_messages.host_id)",
            [],
        )?;
        if rows > 0 {
            tracing::info!("Purged {rows} message(s) for removed hosts");
        }
        Ok(rows)
    }

    /// Operator purge. Only FAILED rows among `message_ids` are removed.
    pub fn delete_failed_messages(&self, message_ids: &[String]) -> QueueResult<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; message_ids.len()].join(", ");
        let rows = self.conn().execute(
            &format!(
                "DELETE FROM queue_messages WHERE status = 'failed' AND message_id IN ({placeholders})"
            ),
            params_from_iter(message_ids.iter()),
        )?;
        tracing::info!("Deleted {rows} failed message(s)");
        Ok(rows)
    }
}
