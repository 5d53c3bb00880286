use std::sync::Arc;

use anyhow::Result;

use super::{blocking, record_failure, CycleReport};
use crate::config::ProcessorConfig;
use crate::db::{deserialize_message_data, DecodedPayload, Direction, Host, PayloadMap, QueueMessage, QueueStore};
use crate::metrics::{Outcome, QueueMetrics};
use crate::transport::{outbound_envelope, Transport};

/// The only outbound type agents currently understand.
pub const COMMAND: &str = "command";

/// Drains server → agent messages into the transport.
pub struct OutboundProcessor {
    store: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    config: ProcessorConfig,
    metrics: QueueMetrics,
}

impl OutboundProcessor {
    pub fn new(
        store: Arc<QueueStore>,
        transport: Arc<dyn Transport>,
        config: ProcessorConfig,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            store,
            transport,
            config,
            metrics,
        }
    }

    /// Deliver one bounded batch of host-addressed rows, then pending broadcasts.
    pub async fn process_outbound_messages(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let limit = self.config.outbound_batch;
        let batch = blocking(&self.store, move |s| s.dequeue_outbound_batch(limit)).await?;

        for (host_id, messages) in group_by_host(batch) {
            let lookup_id = host_id.clone();
            let host = blocking(&self.store, move |s| s.get_host(&lookup_id)).await?;

            let host = match host {
                Some(host) if host.is_approved() => host,
                other => {
                    let (reason, retry) = match other {
                        Some(host) => (
                            format!("host {host_id} is not approved (status {})", host.approval_status),
                            true,
                        ),
                        None => (format!("host {host_id} not found"), false),
                    };
                    tracing::warn!(
                        "Rejecting {} outbound message(s) for host {host_id}: {reason}",
                        messages.len()
                    );
                    for message in &messages {
                        report.record(
                            record_failure(&self.store, &self.metrics, message, &reason, retry)
                                .await?,
                        );
                    }
                    continue;
                }
            };

            for message in &messages {
                report.record(self.process_outbound_message(message, &host).await?);
            }
        }

        report += self.process_broadcasts().await?;
        Ok(report)
    }

    /// Claim one row and dispatch it by `message_type`.
    pub async fn process_outbound_message(
        &self,
        message: &QueueMessage,
        host: &Host,
    ) -> Result<Outcome> {
        let claim_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_processing(&claim_id)).await? {
            tracing::debug!("Message {} claimed elsewhere, skipping", message.message_id);
            return Ok(Outcome::Skipped);
        }

        let data = match deserialize_message_data(message) {
            DecodedPayload::Malformed { error } => {
                let reason = format!("malformed payload: {error}");
                return record_failure(&self.store, &self.metrics, message, &reason, true).await;
            }
            decoded => decoded.into_map(),
        };

        match message.message_type.as_str() {
            COMMAND => self.send_command_to_agent(message, host, data).await,
            other => {
                let reason = format!("unsupported outbound message type '{other}'");
                record_failure(&self.store, &self.metrics, message, &reason, false).await
            }
        }
    }

    /// Hand a claimed command to the transport. Success leaves the row SENT,
    /// awaiting the agent's `command_result`.
    pub async fn send_command_to_agent(
        &self,
        message: &QueueMessage,
        host: &Host,
        data: PayloadMap,
    ) -> Result<Outcome> {
        let envelope = outbound_envelope(message, data);
        let failure = match self.transport.send_to_host(&host.id, &envelope).await {
            Ok(true) => None,
            Ok(false) => Some("agent not connected".to_string()),
            Err(e) => Some(format!("{e:#}")),
        };

        if let Some(reason) = failure {
            tracing::warn!(
                "Command {} to {} not delivered: {reason}",
                message.message_id,
                host.fqdn
            );
            return record_failure(&self.store, &self.metrics, message, &reason, true).await;
        }

        let sent_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_sent(&sent_id)).await? {
            tracing::warn!("Command {} changed state during send", message.message_id);
            return Ok(Outcome::Skipped);
        }
        tracing::debug!("Command {} sent to {}", message.message_id, host.fqdn);
        self.metrics.record(Direction::Outbound, Outcome::Sent);
        Ok(Outcome::Sent)
    }

    /// Hostless outbound rows go to every connected agent. There is no
    /// per-host ack for these, so any recipient completes the row.
    async fn process_broadcasts(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let limit = self.config.broadcast_batch;
        let batch =
            blocking(&self.store, move |s| s.dequeue_broadcast_messages(Direction::Outbound, limit))
                .await?;

        for message in &batch {
            report.record(self.process_broadcast_message(message).await?);
        }
        Ok(report)
    }

    async fn process_broadcast_message(&self, message: &QueueMessage) -> Result<Outcome> {
        let claim_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_processing(&claim_id)).await? {
            return Ok(Outcome::Skipped);
        }

        let data = match deserialize_message_data(message) {
            DecodedPayload::Malformed { error } => {
                let reason = format!("malformed payload: {error}");
                return record_failure(&self.store, &self.metrics, message, &reason, true).await;
            }
            decoded => decoded.into_map(),
        };

        let envelope = outbound_envelope(message, data);
        let failure = match self.transport.broadcast_to_all(&envelope).await {
            Ok(0) => Some("no agents connected".to_string()),
            Ok(n) => {
                tracing::info!("Broadcast {} delivered to {n} agent(s)", message.message_id);
                None
            }
            Err(e) => Some(format!("{e:#}")),
        };

        if let Some(reason) = failure {
            return record_failure(&self.store, &self.metrics, message, &reason, true).await;
        }

        let done_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_completed(&done_id)).await? {
            return Ok(Outcome::Skipped);
        }
        self.metrics.record(Direction::Outbound, Outcome::Completed);
        Ok(Outcome::Completed)
    }
}

/// Group rows by host, keeping the batch order of first appearance.
fn group_by_host(batch: Vec<QueueMessage>) -> Vec<(String, Vec<QueueMessage>)> {
    let mut groups: Vec<(String, Vec<QueueMessage>)> = Vec::new();
    for message in batch {
        let Some(host_id) = message.host_id.clone() else {
            continue;
        };
        match groups.iter_mut().find(|(id, _)| *id == host_id) {
            Some((_, messages)) => messages.push(message),
            None => groups.push((host_id, vec![message])),
        }
    }
    groups
}
