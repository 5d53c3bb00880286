//! Agent transport seam, the in-process connection manager, and the envelope
//! formats exchanged with agents.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::db::{Direction, NewQueueMessage, PayloadMap, Priority, QueueMessage, QueueStore};
use crate::error::{QueueError, QueueResult};

/// Inbound frame type carrying the outcome of a previously sent command.
pub const COMMAND_RESULT: &str = "command_result";

/// Delivery channel to connected agents.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `Ok(false)` when the host has no live connection.
    async fn send_to_host(&self, host_id: &str, payload: &serde_json::Value) -> anyhow::Result<bool>;

    /// Returns how many connections accepted the payload.
    async fn broadcast_to_all(&self, payload: &serde_json::Value) -> anyhow::Result<usize>;
}

/// One bounded mpsc sender per connected host. The socket layer owns the
/// receiving halves and writes whatever arrives to the wire.
#[derive(Default)]
pub struct ConnectionManager {
    connections: Mutex<HashMap<String, mpsc::Sender<serde_json::Value>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<serde_json::Value>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a connection for `host_id`, replacing any previous one.
    pub fn register(&self, host_id: &str, buffer: usize) -> mpsc::Receiver<serde_json::Value> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        if self.lock().insert(host_id.to_string(), tx).is_some() {
            tracing::info!("Replaced existing connection for host {host_id}");
        } else {
            tracing::info!("Host {host_id} connected");
        }
        rx
    }

    pub fn unregister(&self, host_id: &str) -> bool {
        let removed = self.lock().remove(host_id).is_some();
        if removed {
            tracing::info!("Host {host_id} disconnected");
        }
        removed
    }

    pub fn is_connected(&self, host_id: &str) -> bool {
        self.lock().get(host_id).is_some_and(|tx| !tx.is_closed())
    }

    pub fn connected_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        hosts.sort();
        hosts
    }

    fn sender(&self, host_id: &str) -> Option<mpsc::Sender<serde_json::Value>> {
        self.lock().get(host_id).cloned()
    }

    fn senders(&self) -> Vec<(String, mpsc::Sender<serde_json::Value>)> {
        self.lock()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect()
    }

    fn prune(&self, host_id: &str) {
        let mut connections = self.lock();
        if connections.get(host_id).is_some_and(|tx| tx.is_closed()) {
            connections.remove(host_id);
            tracing::info!("Pruned closed connection for host {host_id}");
        }
    }
}

#[async_trait]
impl Transport for ConnectionManager {
    async fn send_to_host(&self, host_id: &str, payload: &serde_json::Value) -> anyhow::Result<bool> {
        let Some(tx) = self.sender(host_id) else {
            return Ok(false);
        };
        if tx.send(payload.clone()).await.is_err() {
            self.prune(host_id);
            return Ok(false);
        }
        Ok(true)
    }

    async fn broadcast_to_all(&self, payload: &serde_json::Value) -> anyhow::Result<usize> {
        let mut delivered = 0;
        for (host_id, tx) in self.senders() {
            if tx.send(payload.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.prune(&host_id);
            }
        }
        Ok(delivered)
    }
}

// ── Envelopes ───────────────────────────────────────────────────

/// Frame as sent by an agent.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentFrame {
    pub message_type: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl AgentFrame {
    /// The outbound `message_id` this frame answers, if any.
    pub fn acknowledged_command(&self) -> Option<&str> {
        if self.message_type != COMMAND_RESULT {
            return None;
        }
        self.data
            .get("command_id")
            .and_then(serde_json::Value::as_str)
            .or(self.reply_to.as_deref())
            .filter(|id| !id.is_empty())
    }
}

/// Envelope written to the agent for an outbound row.
pub fn outbound_envelope(message: &QueueMessage, data: PayloadMap) -> serde_json::Value {
    serde_json::json!({
        "message_type": message.message_type,
        "message_id": message.message_id,
        "data": data,
        "correlation_id": message.correlation_id,
        "reply_to": message.reply_to,
    })
}

/// Persist one agent frame as a PENDING inbound row.
///
/// `host_id` is the connection's authenticated host, if known; otherwise the
/// row is hostless and the inbound processor resolves it from `data.hostname`.
/// A `command_result` frame from a known host first acknowledges the command
/// it answers, provided the command was addressed to that host; both writes
/// happen in one unit of work. Hostless frames never acknowledge anything.
pub fn ingest_agent_frame(
    store: &QueueStore,
    host_id: Option<&str>,
    frame: &serde_json::Value,
) -> QueueResult<String> {
    let frame: AgentFrame = serde_json::from_value(frame.clone())
        .map_err(|e| QueueError::invalid(format!("malformed agent frame: {e}")))?;
    if frame.message_type.trim().is_empty() {
        return Err(QueueError::invalid("agent frame has an empty message_type"));
    }
    if !(frame.data.is_object() || frame.data.is_null()) {
        return Err(QueueError::invalid("agent frame data must be a JSON object"));
    }

    let mut msg = NewQueueMessage::new(frame.message_type.clone(), frame.data.clone(), Direction::Inbound)
        .with_priority(frame.priority.unwrap_or_default());
    msg.host_id = host_id.map(str::to_string);
    msg.message_id = frame.message_id.clone();
    msg.correlation_id = frame.correlation_id.clone();
    msg.reply_to = frame.reply_to.clone();

    store.unit_of_work(|ops| {
        match (frame.acknowledged_command(), host_id) {
            (Some(command_id), Some(host_id)) => {
                if ops.mark_acknowledged(command_id, host_id)? {
                    tracing::debug!("Command {command_id} acknowledged by {host_id}");
                } else {
                    tracing::warn!(
                        "Result from {host_id} for command {command_id}, which it has no pending ack for"
                    );
                }
            }
            (Some(command_id), None) => {
                tracing::warn!("Hostless result for command {command_id} cannot acknowledge it");
            }
            (None, _) => {}
        }
        ops.enqueue_message(&msg)
    })
}
