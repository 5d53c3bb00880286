//! Read-only aggregation for operators.

use rusqlite::params;
use serde::Serialize;

use super::queue::MESSAGE_COLUMNS;
use super::{Direction, MessageStatus, QueueMessage, QueueOps};
use crate::error::QueueResult;

/// Row counts by status. `pending` excludes expired rows, which are counted
/// under `expired` instead.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub sent: u64,
    pub completed: u64,
    pub failed: u64,
    pub expired: u64,
    pub total: u64,
}

impl QueueStats {
    pub fn count(&self, status: MessageStatus) -> u64 {
        match status {
            MessageStatus::Pending => self.pending,
            MessageStatus::InProgress => self.in_progress,
            MessageStatus::Sent => self.sent,
            MessageStatus::Completed => self.completed,
            MessageStatus::Failed => self.failed,
        }
    }
}

impl QueueOps<'_> {
    pub fn get_queue_stats(
        &self,
        host_id: Option<&str>,
        direction: Option<Direction>,
    ) -> QueueResult<QueueStats> {
        let mut stmt = self.conn().prepare(
            "SELECT status, expired_at IS NOT NULL AS expired, COUNT(*)
             FROM queue_messages
             WHERE (?1 IS NULL OR host_id = ?1) AND (?2 IS NULL OR direction = ?2)
             GROUP BY status, expired",
        )?;
        let rows = stmt.query_map(
            params![host_id, direction.map(Direction::as_str)],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, bool>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut stats = QueueStats::default();
        for row in rows {
            let (status, expired, count) = row?;
            let count = count.max(0) as u64;
            stats.total += count;
            if expired {
                stats.expired += count;
                continue;
            }
            match status.parse::<MessageStatus>()? {
                MessageStatus::Pending => stats.pending += count,
                MessageStatus::InProgress => stats.in_progress += count,
                MessageStatus::Sent => stats.sent += count,
                MessageStatus::Completed => stats.completed += count,
                MessageStatus::Failed => stats.failed += count,
            }
        }
        Ok(stats)
    }

    /// Most recent FAILED rows first.
    pub fn get_failed_messages(&self, limit: usize) -> QueueResult<Vec<QueueMessage>> {
        self.query_messages(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM queue_messages WHERE status = 'failed'
                 ORDER BY COALESCE(last_error_at, completed_at, created_at) DESC, id DESC
                 LIMIT ?1"
            ),
            params![limit as i64],
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::db::{ApprovalStatus, Direction, NewQueueMessage, QueueStore};
    use serde_json::json;

    #[test]
    fn stats_count_each_status_and_filter() {
        let store = QueueStore::open_in_memory().unwrap();
        store.create_host("h1", "a.example.com", ApprovalStatus::Approved).unwrap();
        store.create_host("h2", "b.example.com", ApprovalStatus::Approved).unwrap();

        let ids: Vec<String> = (0..4)
            .map(|_| {
                store
                    .enqueue_message(&NewQueueMessage::outbound("command", json!({})).for_host("h1"))
                    .unwrap()
            })
            .collect();
        store
            .enqueue_message(&NewQueueMessage::inbound("heartbeat", json!({})).for_host("h2"))
            .unwrap();

        store.mark_processing(&ids[0]).unwrap();
        store.mark_processing(&ids[1]).unwrap();
        store.mark_sent(&ids[1]).unwrap();
        store.mark_failed(&ids[2], Some("boom"), false).unwrap();

        let all = store.get_queue_stats(None, None).unwrap();
        assert_eq!(all.total, 5);
        assert_eq!(all.pending, 2);
        assert_eq!(all.in_progress, 1);
        assert_eq!(all.sent, 1);
        assert_eq!(all.failed, 1);
        assert_eq!(all.completed, 0);

        let h1 = store.get_queue_stats(Some("h1"), None).unwrap();
        assert_eq!(h1.total, 4);
        assert_eq!(h1.pending, 1);

        let inbound = store.get_queue_stats(None, Some(Direction::Inbound)).unwrap();
        assert_eq!(inbound.total, 1);
        assert_eq!(inbound.pending, 1);

        let none = store.get_queue_stats(Some("h1"), Some(Direction::Inbound)).unwrap();
        assert_eq!(none.total, 0);
    }

    #[test]
    fn failed_messages_are_listed_newest_first_and_limited() {
        let store = QueueStore::open_in_memory().unwrap();
        let ids: Vec<String> = (0..3)
            .map(|n| {
                store
                    .enqueue_message(&NewQueueMessage::inbound("t", json!({"n": n})))
                    .unwrap()
            })
            .collect();
        for id in &ids {
            store.mark_failed(id, Some("boom"), false).unwrap();
        }

        let failed = store.get_failed_messages(2).unwrap();
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].message_id, ids[2]);
        assert_eq!(failed[1].message_id, ids[1]);
        assert_eq!(failed[0].error_message.as_deref(), Some("boom"));
    }
}
