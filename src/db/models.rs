use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};

/// Storage format for every timestamp column. Fixed width, so lexical order
/// in SQLite matches chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f").map(|naive| naive.and_utc())
}

/// `now - secs`. Negative or unrepresentable windows are `InvalidArgument`.
pub fn cutoff_secs_ago(now: DateTime<Utc>, secs: i64) -> QueueResult<DateTime<Utc>> {
    if secs < 0 {
        return Err(QueueError::invalid(format!("age window {secs}s must not be negative")));
    }
    TimeDelta::try_seconds(secs)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| QueueError::invalid(format!("age window {secs}s is out of range")))
}

/// `now - days`, with the same rules as [`cutoff_secs_ago`].
pub fn cutoff_days_ago(now: DateTime<Utc>, days: i64) -> QueueResult<DateTime<Utc>> {
    let secs = days
        .checked_mul(86_400)
        .ok_or_else(|| QueueError::invalid(format!("age window of {days} days is out of range")))?;
    cutoff_secs_ago(now, secs)
}

// ── Enumerations ────────────────────────────────────────────────

/// Which way a message travels relative to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Agent → server telemetry.
    Inbound,
    /// Server → agent commands.
    Outbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    InProgress,
    /// Outbound only: handed to the transport, not yet acknowledged.
    Sent,
    Completed,
    Failed,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Sent,
        Self::Completed,
        Self::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Sent => "sent",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    pub fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

macro_rules! text_enum {
    ($ty:ty, $what:literal, [$($variant:ident),+]) => {
        impl ::std::str::FromStr for $ty {
            type Err = $crate::error::QueueError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                let lowered = value.trim().to_ascii_lowercase();
                $(
                    if lowered == <$ty>::$variant.as_str() {
                        return Ok(<$ty>::$variant);
                    }
                )+
                Err($crate::error::QueueError::invalid(format!("unknown {} '{value}'", $what)))
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

pub(crate) use text_enum;

text_enum!(Direction, "direction", [Inbound, Outbound]);
text_enum!(MessageStatus, "status", [Pending, InProgress, Sent, Completed, Failed]);
text_enum!(Priority, "priority", [Low, Normal, High, Urgent]);

// ── Rows ────────────────────────────────────────────────────────

/// One durable queue row.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMessage {
    #[serde(skip)]
    pub id: i64,
    pub message_id: String,
    pub host_id: Option<String>,
    pub direction: Direction,
    pub message_type: String,
    pub message_data: Option<String>,
    pub status: MessageStatus,
    pub priority: Priority,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// Parameters for `enqueue_message`.
#[derive(Debug, Clone)]
pub struct NewQueueMessage {
    pub message_type: String,
    pub payload: serde_json::Value,
    pub direction: Direction,
    pub host_id: Option<String>,
    pub priority: Priority,
    pub message_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// `None` uses the configured default (3).
    pub max_retries: Option<i64>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

impl NewQueueMessage {
    pub fn new(
        message_type: impl Into<String>,
        payload: serde_json::Value,
        direction: Direction,
    ) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            direction,
            host_id: None,
            priority: Priority::Normal,
            message_id: None,
            scheduled_at: None,
            max_retries: None,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn inbound(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(message_type, payload, Direction::Inbound)
    }

    pub fn outbound(message_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(message_type, payload, Direction::Outbound)
    }

    pub fn for_host(mut self, host_id: impl Into<String>) -> Self {
        self.host_id = Some(host_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

// ── Payload decoding ────────────────────────────────────────────

pub type PayloadMap = serde_json::Map<String, serde_json::Value>;

/// Result of decoding a row's `message_data`.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    /// NULL, blank, JSON `null` or `{}`.
    Empty,
    Present(PayloadMap),
    Malformed { error: String },
}

impl DecodedPayload {
    pub fn decode(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
            return Self::Empty;
        };
        match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Null) => Self::Empty,
            Ok(serde_json::Value::Object(map)) if map.is_empty() => Self::Empty,
            Ok(serde_json::Value::Object(map)) => Self::Present(map),
            Ok(other) => Self::Malformed {
                error: format!("expected a JSON object, found {}", json_kind(&other)),
            },
            Err(e) => Self::Malformed {
                error: e.to_string(),
            },
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }

    /// Soft-fail view: a malformed payload becomes an empty map.
    pub fn into_map(self) -> PayloadMap {
        match self {
            Self::Present(map) => map,
            Self::Empty | Self::Malformed { .. } => PayloadMap::new(),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
