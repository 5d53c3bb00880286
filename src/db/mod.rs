pub mod hosts;
pub mod maintenance;
pub mod models;
pub mod queue;
pub mod stats;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::config::RetryConfig;
use crate::error::{QueueError, QueueResult};

pub use hosts::{ApprovalStatus, Host};
pub use models::{
    DecodedPayload, Direction, MessageStatus, NewQueueMessage, PayloadMap, Priority,
    QueueMessage,
};
pub use queue::{deserialize_message_data, QueueOps};
pub use stats::QueueStats;

/// SQLite-backed durable queue.
///
/// Thread safety: wraps `Connection` in `Mutex`. Processes sharing one database
/// file each open their own `QueueStore`; cross-process exclusion comes from the
/// guarded status transitions, not from this lock.
pub struct QueueStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    retry: RetryConfig,
}

impl QueueStore {
    /// Open (or create) the queue database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open queue DB: {}", db_path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;",
        )
        .context("Failed to set SQLite pragmas")?;

        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: db_path.to_path_buf(),
            retry: RetryConfig::default(),
        })
    }

    /// Open an in-memory store (tests and one-shot tooling).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
            retry: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hosts (
                id TEXT PRIMARY KEY NOT NULL,
                fqdn TEXT NOT NULL COLLATE NOCASE,
                approval_status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                last_seen_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_hosts_fqdn ON hosts(fqdn);",
        )
        .context("Failed to initialize hosts schema")?;

        // No foreign key to hosts: rows for a removed host must survive until the
        // processor (or an explicit purge) deletes them.
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                host_id TEXT,
                direction TEXT NOT NULL CHECK (direction IN ('inbound', 'outbound')),
                message_type TEXT NOT NULL,
                message_data TEXT,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'in_progress', 'sent', 'completed', 'failed')),
                priority TEXT NOT NULL DEFAULT 'normal'
                    CHECK (priority IN ('low', 'normal', 'high', 'urgent')),
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                created_at TEXT NOT NULL,
                started_at TEXT,
                sent_at TEXT,
                completed_at TEXT,
                scheduled_at TEXT,
                expired_at TEXT,
                last_error_at TEXT,
                error_message TEXT,
                correlation_id TEXT,
                reply_to TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_messages_message_id
                ON queue_messages(message_id);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_dispatch
                ON queue_messages(direction, status, host_id);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_host
                ON queue_messages(host_id);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_scheduled
                ON queue_messages(scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_created
                ON queue_messages(created_at);
            CREATE INDEX IF NOT EXISTS idx_queue_messages_correlation
                ON queue_messages(correlation_id) WHERE correlation_id IS NOT NULL;",
        )
        .context("Failed to initialize queue schema")?;

        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` in autocommit mode: every statement commits on its own.
    pub fn with_ops<T, E>(&self, f: impl FnOnce(&QueueOps<'_>) -> Result<T, E>) -> Result<T, E> {
        let guard = self.lock();
        f(&QueueOps::new(&guard, &self.retry))
    }

    /// Run `f` inside one transaction. Commits on `Ok`; any `Err` (or a panic)
    /// drops the transaction, which rolls it back.
    pub fn unit_of_work<T, E>(&self, f: impl FnOnce(&QueueOps<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut guard = self.lock();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&QueueOps::new(&tx, &self.retry))?;
        tx.commit()?;
        Ok(value)
    }

    pub fn health_check(&self) -> Result<()> {
        self.lock()
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Queue database health check failed")?;
        Ok(())
    }

    // ── Producer / consumer surface ────────────────────────────

    pub fn enqueue_message(&self, msg: &NewQueueMessage) -> QueueResult<String> {
        self.unit_of_work(|ops| ops.enqueue_message(msg))
    }

    pub fn get_message(&self, message_id: &str) -> QueueResult<Option<QueueMessage>> {
        self.with_ops(|ops| ops.get_message(message_id))
    }

    pub fn dequeue_messages_for_host(
        &self,
        host_id: &str,
        direction: Direction,
        limit: usize,
        priority_order: bool,
    ) -> QueueResult<Vec<QueueMessage>> {
        self.with_ops(|ops| ops.dequeue_messages_for_host(host_id, direction, limit, priority_order))
    }

    pub fn dequeue_broadcast_messages(
        &self,
        direction: Direction,
        limit: usize,
    ) -> QueueResult<Vec<QueueMessage>> {
        self.with_ops(|ops| ops.dequeue_broadcast_messages(direction, limit))
    }

    pub fn dequeue_outbound_batch(&self, limit: usize) -> QueueResult<Vec<QueueMessage>> {
        self.with_ops(|ops| ops.dequeue_outbound_batch(limit))
    }

    pub fn hosts_with_pending(&self, direction: Direction, limit: usize) -> QueueResult<Vec<String>> {
        self.with_ops(|ops| ops.hosts_with_pending(direction, limit))
    }

    pub fn mark_processing(&self, message_id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| ops.mark_processing(message_id))
    }

    pub fn mark_completed(&self, message_id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| ops.mark_completed(message_id))
    }

    pub fn mark_sent(&self, message_id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| ops.mark_sent(message_id))
    }

    pub fn mark_acknowledged(&self, message_id: &str, host_id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| ops.mark_acknowledged(message_id, host_id))
    }

    pub fn mark_failed(
        &self,
        message_id: &str,
        error_message: Option<&str>,
        retry: bool,
    ) -> QueueResult<bool> {
        self.with_ops(|ops| ops.mark_failed(message_id, error_message, retry))
    }

    pub fn retry_unacknowledged_messages(&self, timeout_secs: u64) -> QueueResult<usize> {
        self.with_ops(|ops| ops.retry_unacknowledged_messages(timeout_secs))
    }

    pub fn reset_stuck_messages(
        &self,
        direction: Direction,
        threshold_secs: u64,
    ) -> QueueResult<usize> {
        self.with_ops(|ops| ops.reset_stuck_messages(direction, threshold_secs))
    }

    // ── Maintenance ────────────────────────────────────────────

    pub fn expire_old_messages(&self, max_age_secs: i64) -> QueueResult<usize> {
        self.with_ops(|ops| ops.expire_old_messages(max_age_secs))
    }

    pub fn cleanup_old_messages(&self, older_than_days: i64, keep_failed: bool) -> QueueResult<usize> {
        self.with_ops(|ops| ops.cleanup_old_messages(older_than_days, keep_failed))
    }

    pub fn delete_messages_for_host(&self, host_id: &str) -> QueueResult<usize> {
        self.with_ops(|ops| ops.delete_messages_for_host(host_id))
    }

    pub fn purge_orphaned_messages(&self) -> QueueResult<usize> {
        self.with_ops(|ops| ops.purge_orphaned_messages())
    }

    pub fn delete_failed_messages(&self, message_ids: &[String]) -> QueueResult<usize> {
        self.with_ops(|ops| ops.delete_failed_messages(message_ids))
    }

    // ── Stats ──────────────────────────────────────────────────

    pub fn get_queue_stats(
        &self,
        host_id: Option<&str>,
        direction: Option<Direction>,
    ) -> QueueResult<QueueStats> {
        self.with_ops(|ops| ops.get_queue_stats(host_id, direction))
    }

    pub fn get_failed_messages(&self, limit: usize) -> QueueResult<Vec<QueueMessage>> {
        self.with_ops(|ops| ops.get_failed_messages(limit))
    }

    // ── Host directory ─────────────────────────────────────────

    pub fn create_host(
        &self,
        id: &str,
        fqdn: &str,
        approval_status: ApprovalStatus,
    ) -> QueueResult<Host> {
        self.with_ops(|ops| hosts::create_host(ops.conn(), id, fqdn, approval_status))
    }

    pub fn get_host(&self, id: &str) -> QueueResult<Option<Host>> {
        self.with_ops(|ops| hosts::get_host(ops.conn(), id))
    }

    pub fn get_host_by_fqdn(&self, fqdn: &str) -> QueueResult<Option<Host>> {
        self.with_ops(|ops| hosts::get_host_by_fqdn(ops.conn(), fqdn))
    }

    pub fn set_approval_status(&self, id: &str, status: ApprovalStatus) -> QueueResult<bool> {
        self.with_ops(|ops| hosts::set_approval_status(ops.conn(), id, status))
    }

    pub fn touch_host(&self, id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| hosts::touch_host(ops.conn(), id))
    }

    pub fn delete_host(&self, id: &str) -> QueueResult<bool> {
        self.with_ops(|ops| hosts::delete_host(ops.conn(), id))
    }

    pub fn list_hosts(&self) -> QueueResult<Vec<Host>> {
        self.with_ops(|ops| hosts::list_hosts(ops.conn()))
    }

    /// De-approve a host and purge every queued row for it in one unit of work.
    /// Returns the number of queue rows purged, or `None` if the host was unknown.
    pub fn revoke_host(&self, id: &str) -> QueueResult<Option<usize>> {
        self.unit_of_work(|ops| {
            if !hosts::set_approval_status(ops.conn(), id, ApprovalStatus::Revoked)? {
                return Ok(None);
            }
            ops.delete_messages_for_host(id).map(Some)
        })
    }

    /// Delete a host and every queued row for it in one unit of work.
    /// Returns the number of queue rows purged, or `None` if the host was unknown.
    pub fn remove_host(&self, id: &str) -> QueueResult<Option<usize>> {
        self.unit_of_work(|ops| {
            if !hosts::delete_host(ops.conn(), id)? {
                return Ok(None);
            }
            ops.delete_messages_for_host(id).map(Some)
        })
    }
}

// ── Row decoding helpers ───────────────────────────────────────

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn enum_column<T>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = QueueError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    models::parse_timestamp(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn optional_timestamp_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| models::parse_timestamp(&value).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_in_memory_is_healthy_and_empty() {
        let store = QueueStore::open_in_memory().unwrap();
        store.health_check().unwrap();
        let stats = store.get_queue_stats(None, None).unwrap();
        assert_eq!(stats.total, 0);
    }

    #[test]
    fn open_creates_parent_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("queue.db");
        let store = QueueStore::open(&path).unwrap();
        store.health_check().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn schema_init_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("queue.db");
        drop(QueueStore::open(&path).unwrap());
        let store = QueueStore::open(&path).unwrap();
        store.health_check().unwrap();
    }

    #[test]
    fn unit_of_work_rolls_back_on_error() {
        let store = QueueStore::open_in_memory().unwrap();
        store
            .create_host("h1", "web-01.example.com", ApprovalStatus::Approved)
            .unwrap();

        let result: QueueResult<()> = store.unit_of_work(|ops| {
            ops.enqueue_message(&NewQueueMessage::outbound("command", json!({"cmd": "a"})).for_host("h1"))?;
            // Unknown host fails validation and aborts the whole unit.
            ops.enqueue_message(&NewQueueMessage::outbound("command", json!({"cmd": "b"})).for_host("nope"))?;
            Ok(())
        });

        assert!(matches!(result, Err(QueueError::HostNotFound(_))));
        assert_eq!(store.get_queue_stats(None, None).unwrap().total, 0);
    }

    #[test]
    fn unit_of_work_commits_all_rows_together() {
        let store = QueueStore::open_in_memory().unwrap();
        store
            .create_host("h1", "web-01.example.com", ApprovalStatus::Approved)
            .unwrap();

        let ids = store
            .unit_of_work(|ops| -> QueueResult<Vec<String>> {
                let a = ops.enqueue_message(&NewQueueMessage::outbound("command", json!({"n": 1})).for_host("h1"))?;
                let b = ops.enqueue_message(&NewQueueMessage::outbound("command", json!({"n": 2})).for_host("h1"))?;
                Ok(vec![a, b])
            })
            .unwrap();

        assert_eq!(ids.len(), 2);
        assert_eq!(store.get_queue_stats(None, None).unwrap().pending, 2);
    }

    #[test]
    fn remove_host_purges_rows_in_one_step() {
        let store = QueueStore::open_in_memory().unwrap();
        store
            .create_host("h1", "web-01.example.com", ApprovalStatus::Approved)
            .unwrap();
        for n in 0..3 {
            store
                .enqueue_message(&NewQueueMessage::inbound("heartbeat", json!({"n": n})).for_host("h1"))
                .unwrap();
        }

        assert_eq!(store.remove_host("h1").unwrap(), Some(3));
        assert!(store.get_host("h1").unwrap().is_none());
        assert_eq!(store.get_queue_stats(Some("h1"), None).unwrap().total, 0);
        assert_eq!(store.remove_host("h1").unwrap(), None);
    }

    #[test]
    fn revoke_host_purges_rows_and_keeps_the_host() {
        let store = QueueStore::open_in_memory().unwrap();
        store
            .create_host("h1", "web-01.example.com", ApprovalStatus::Approved)
            .unwrap();
        store
            .enqueue_message(&NewQueueMessage::inbound("heartbeat", json!({})).for_host("h1"))
            .unwrap();
        store
            .enqueue_message(&NewQueueMessage::outbound("command", json!({})).for_host("h1"))
            .unwrap();

        assert_eq!(store.revoke_host("h1").unwrap(), Some(2));
        let host = store.get_host("h1").unwrap().unwrap();
        assert_eq!(host.approval_status, ApprovalStatus::Revoked);
        assert_eq!(store.get_queue_stats(Some("h1"), None).unwrap().total, 0);
        assert_eq!(store.revoke_host("nope").unwrap(), None);
    }
}
