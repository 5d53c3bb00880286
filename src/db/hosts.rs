//! Host directory: the managed machines agents run on, and their approval state.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::models::{format_timestamp, text_enum};
use super::{enum_column, optional_timestamp_column, timestamp_column};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Revoked,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Revoked => "revoked",
        }
    }
}

text_enum!(ApprovalStatus, "approval status", [Pending, Approved, Revoked]);

/// A managed host as seen by the queue.
#[derive(Debug, Clone, Serialize)]
pub struct Host {
    pub id: String,
    pub fqdn: String,
    pub approval_status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Host {
    pub fn is_approved(&self) -> bool {
        self.approval_status == ApprovalStatus::Approved
    }
}

const HOST_COLUMNS: &str = "id, fqdn, approval_status, created_at, last_seen_at";

fn row_to_host(row: &rusqlite::Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        fqdn: row.get(1)?,
        approval_status: enum_column(row, 2)?,
        created_at: timestamp_column(row, 3)?,
        last_seen_at: optional_timestamp_column(row, 4)?,
    })
}

pub fn create_host(
    conn: &Connection,
    id: &str,
    fqdn: &str,
    approval_status: ApprovalStatus,
) -> QueueResult<Host> {
    if id.trim().is_empty() || fqdn.trim().is_empty() {
        return Err(QueueError::invalid("host id and fqdn must not be empty"));
    }

    let now = format_timestamp(Utc::now());
    conn.execute(
        "INSERT INTO hosts (id, fqdn, approval_status, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![id, fqdn, approval_status.as_str(), now],
    )
    .map_err(|e| match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => {
            QueueError::invalid(format!("host '{id}' or fqdn '{fqdn}' already registered"))
        }
        _ => QueueError::from(e),
    })?;

    get_host(conn, id)?.ok_or_else(|| QueueError::HostNotFound(id.to_string()))
}

pub fn get_host(conn: &Connection, id: &str) -> QueueResult<Option<Host>> {
    let host = conn
        .query_row(
            &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE id = ?1"),
            params![id],
            row_to_host,
        )
        .optional()?;
    Ok(host)
}

/// Case-insensitive lookup by fully qualified hostname.
pub fn get_host_by_fqdn(conn: &Connection, fqdn: &str) -> QueueResult<Option<Host>> {
    let host = conn
        .query_row(
            &format!("SELECT {HOST_COLUMNS} FROM hosts WHERE fqdn = ?1"),
            params![fqdn.trim()],
            row_to_host,
        )
        .optional()?;
    Ok(host)
}

pub fn set_approval_status(
    conn: &Connection,
    id: &str,
    approval_status: ApprovalStatus,
) -> QueueResult<bool> {
    let rows = conn.execute(
        "UPDATE hosts SET approval_status = ?1 WHERE id = ?2",
        params![approval_status.as_str(), id],
    )?;
    Ok(rows > 0)
}

pub fn touch_host(conn: &Connection, id: &str) -> QueueResult<bool> {
    let rows = conn.execute(
        "UPDATE hosts SET last_seen_at = ?1 WHERE id = ?2",
        params![format_timestamp(Utc::now()), id],
    )?;
    Ok(rows > 0)
}

/// Remove the directory entry only. Queued rows are left for the processor
/// (or `delete_messages_for_host`) to purge.
pub fn delete_host(conn: &Connection, id: &str) -> QueueResult<bool> {
    let rows = conn.execute("DELETE FROM hosts WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub fn list_hosts(conn: &Connection) -> QueueResult<Vec<Host>> {
    let mut stmt = conn.prepare(&format!("SELECT {HOST_COLUMNS} FROM hosts ORDER BY fqdn"))?;
    let rows = stmt.query_map([], row_to_host)?;
    let mut hosts = Vec::new();
    for row in rows {
        hosts.push(row?);
    }
    Ok(hosts)
}
