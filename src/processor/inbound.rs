use std::sync::Arc;

use anyhow::Result;

use super::{blocking, record_failure, CycleReport};
use crate::config::ProcessorConfig;
use crate::db::{deserialize_message_data, Direction, Host, QueueMessage, QueueStore};
use crate::handlers::{HostContext, InboundRouter};
use crate::metrics::{Outcome, QueueMetrics};

/// Drains agent → server messages into the business handlers.
pub struct InboundProcessor {
    store: Arc<QueueStore>,
    router: Arc<dyn InboundRouter>,
    config: ProcessorConfig,
    expiry_secs: i64,
    metrics: QueueMetrics,
}

impl InboundProcessor {
    pub fn new(
        store: Arc<QueueStore>,
        router: Arc<dyn InboundRouter>,
        config: ProcessorConfig,
        expiry_secs: i64,
        metrics: QueueMetrics,
    ) -> Self {
        Self {
            store,
            router,
            config,
            expiry_secs,
            metrics,
        }
    }

    /// One inbound cycle: expire, recover stuck claims, purge rows of removed
    /// hosts, then work through per-host backlogs and hostless rows.
    pub async fn process_pending_messages(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let max_age = self.expiry_secs;
        report.expired = blocking(&self.store, move |s| s.expire_old_messages(max_age)).await?;

        let threshold = self.config.stuck_threshold_secs;
        report.stuck_reset = blocking(&self.store, move |s| {
            s.reset_stuck_messages(Direction::Inbound, threshold)
        })
        .await?;

        let orphans = blocking(&self.store, |s| s.purge_orphaned_messages()).await?;
        self.metrics.record_purged(orphans);
        report.purged += orphans;

        let limit = self.config.inbound_hosts_per_cycle;
        let host_ids =
            blocking(&self.store, move |s| s.hosts_with_pending(Direction::Inbound, limit)).await?;
        for host_id in host_ids {
            report += self.process_host_backlog(host_id).await?;
        }

        report += self.process_hostless_messages().await?;
        Ok(report)
    }

    async fn process_host_backlog(&self, host_id: String) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let lookup_id = host_id.clone();
        let host = blocking(&self.store, move |s| s.get_host(&lookup_id)).await?;
        let host = match host {
            Some(host) if host.is_approved() => host,
            other => {
                let reason = match other {
                    Some(host) => format!("approval status is {}", host.approval_status),
                    None => "host no longer exists".to_string(),
                };
                let purge_id = host_id.clone();
                let rows = blocking(&self.store, move |s| s.delete_messages_for_host(&purge_id)).await?;
                tracing::warn!("Purged {rows} queued message(s) for host {host_id}: {reason}");
                self.metrics.record_purged(rows);
                report.purged += rows;
                return Ok(report);
            }
        };

        let limit = self.config.inbound_messages_per_host;
        let batch_host = host.id.clone();
        let batch = blocking(&self.store, move |s| {
            s.dequeue_messages_for_host(&batch_host, Direction::Inbound, limit, true)
        })
        .await?;

        for message in &batch {
            report.record(self.process_validated_message(message, &host).await?);
        }
        Ok(report)
    }

    /// Rows the agent sent before its host id was known: resolve the host from
    /// the `hostname` claimed in the payload.
    async fn process_hostless_messages(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let limit = self.config.null_host_batch;
        let batch =
            blocking(&self.store, move |s| s.dequeue_broadcast_messages(Direction::Inbound, limit))
                .await?;

        for message in &batch {
            let payload = deserialize_message_data(message).into_map();
            let hostname = payload
                .get("hostname")
                .and_then(serde_json::Value::as_str)
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string);

            let Some(hostname) = hostname else {
                let outcome = record_failure(
                    &self.store,
                    &self.metrics,
                    message,
                    "payload carries no hostname",
                    false,
                )
                .await?;
                report.record(outcome);
                continue;
            };

            let lookup = hostname.clone();
            let host = blocking(&self.store, move |s| s.get_host_by_fqdn(&lookup)).await?;
            let outcome = match host {
                Some(host) if host.is_approved() => self.process_validated_message(message, &host).await?,
                Some(host) => {
                    let reason = format!(
                        "host '{hostname}' is not approved (status {})",
                        host.approval_status
                    );
                    record_failure(&self.store, &self.metrics, message, &reason, true).await?
                }
                None => {
                    let reason = format!("unknown host '{hostname}'");
                    record_failure(&self.store, &self.metrics, message, &reason, true).await?
                }
            };
            report.record(outcome);
        }
        Ok(report)
    }

    /// Claim, dispatch and finalize one message for an approved host.
    ///
    /// The handler runs in its own task: an error, a `false` return or a panic
    /// all end in `mark_failed`, never in the caller.
    pub async fn process_validated_message(
        &self,
        message: &QueueMessage,
        host: &Host,
    ) -> Result<Outcome> {
        let claim_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_processing(&claim_id)).await? {
            tracing::debug!("Message {} claimed elsewhere, skipping", message.message_id);
            return Ok(Outcome::Skipped);
        }

        let payload = deserialize_message_data(message).into_map();
        let context = HostContext {
            id: host.id.clone(),
            hostname: host.fqdn.clone(),
        };
        let router = self.router.clone();
        let session = self.store.clone();
        let message_type = message.message_type.clone();
        let dispatch = tokio::spawn(async move {
            router
                .route_inbound_message(&message_type, session, &context, &payload)
                .await
        });

        let failure = match dispatch.await {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some(format!(
                "handler for '{}' did not accept the message",
                message.message_type
            )),
            Ok(Err(e)) => Some(format!("handler error: {e:#}")),
            Err(e) if e.is_panic() => Some("handler panicked".to_string()),
            Err(e) => Some(format!("handler task failed: {e}")),
        };

        if let Some(reason) = failure {
            tracing::warn!("Inbound message {} failed: {reason}", message.message_id);
            return record_failure(&self.store, &self.metrics, message, &reason, true).await;
        }

        let done_id = message.message_id.clone();
        if !blocking(&self.store, move |s| s.mark_completed(&done_id)).await? {
            tracing::warn!("Message {} vanished before completion", message.message_id);
            return Ok(Outcome::Skipped);
        }
        self.metrics.record(Direction::Inbound, Outcome::Completed);
        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ApprovalStatus, MessageStatus, NewQueueMessage, PayloadMap};
    use crate::db::models::format_timestamp;
    use crate::handlers::{HandlerRegistry, InboundCall};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Panicking;

    #[async_trait]
    impl InboundRouter for Panicking {
        async fn route_inbound_message(
            &self,
            _message_type: &str,
            _session: Arc<QueueStore>,
            _host: &HostContext,
            _payload: &PayloadMap,
        ) -> anyhow::Result<bool> {
            panic!("handler blew up");
        }
    }

    fn store() -> Arc<QueueStore> {
        let store = QueueStore::open_in_memory().unwrap();
        store.create_host("h1", "web-01.example.com", ApprovalStatus::Approved).unwrap();
        Arc::new(store)
    }

    fn counting_registry(calls: Arc<AtomicUsize>) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("inventory", move |_call: InboundCall| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(true)
            }
        });
        registry
    }

    fn processor(store: Arc<QueueStore>, router: Arc<dyn InboundRouter>) -> InboundProcessor {
        InboundProcessor::new(
            store,
            router,
            ProcessorConfig::default(),
            86_400,
            QueueMetrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn handled_messages_complete() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let inbound = processor(store.clone(), Arc::new(counting_registry(calls.clone())));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound("inventory", json!({"pkgs": 3})).for_host("h1"))
            .unwrap();

        let report = inbound.process_pending_messages().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Completed);
        assert!(msg.completed_at.is_some());
    }

    #[tokio::test]
    async fn unhandled_type_is_retried() {
        let store = store();
        let inbound = processor(store.clone(), Arc::new(HandlerRegistry::new()));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound("mystery", json!({})).for_host("h1"))
            .unwrap();

        let report = inbound.process_pending_messages().await.unwrap();
        assert_eq!(report.retried, 1);
        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 1);
        assert!(msg.scheduled_at.unwrap() > chrono::Utc::now());
    }

    #[tokio::test]
    async fn handler_panic_is_recorded_as_failure() {
        let store = store();
        let inbound = processor(store.clone(), Arc::new(Panicking));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound("inventory", json!({})).for_host("h1"))
            .unwrap();

        inbound.process_pending_messages().await.unwrap();
        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.error_message.as_deref(), Some("handler panicked"));
    }

    #[tokio::test]
    async fn unapproved_host_backlog_is_purged() {
        let store = store();
        store.create_host("h2", "web-02.example.com", ApprovalStatus::Pending).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let inbound = processor(store.clone(), Arc::new(counting_registry(calls.clone())));
        for _ in 0..3 {
            store
                .enqueue_message(&NewQueueMessage::inbound("inventory", json!({})).for_host("h2"))
                .unwrap();
        }

        let report = inbound.process_pending_messages().await.unwrap();
        assert_eq!(report.purged, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get_queue_stats(Some("h2"), None).unwrap().total, 0);
    }

    #[tokio::test]
    async fn hostless_message_resolves_by_hostname() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let inbound = processor(store.clone(), Arc::new(counting_registry(calls.clone())));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound(
                "inventory",
                json!({"hostname": "WEB-01.example.com"}),
            ))
            .unwrap();

        inbound.process_pending_messages().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.get_message(&id).unwrap().unwrap().status,
            MessageStatus::Completed
        );
    }

    #[tokio::test]
    async fn hostless_message_without_hostname_fails_terminally() {
        let store = store();
        let inbound = processor(store.clone(), Arc::new(HandlerRegistry::new()));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound("inventory", json!({"cpu": 4})))
            .unwrap();

        let report = inbound.process_pending_messages().await.unwrap();
        assert_eq!(report.failed, 1);
        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.error_message.as_deref(), Some("payload carries no hostname"));
    }

    #[tokio::test]
    async fn hostless_message_for_unknown_host_is_retried_with_reason() {
        let store = store();
        let inbound = processor(store.clone(), Arc::new(HandlerRegistry::new()));
        let id = store
            .enqueue_message(&NewQueueMessage::inbound("inventory", json!({"hostname": "nope"})))
            .unwrap();

        inbound.process_pending_messages().await.unwrap();
        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.error_message.as_deref(), Some("unknown host 'nope'"));
    }

    #[tokio::test]
    async fn stuck_claims_are_recovered_in_one_cycle() {
        let store = store();
        // Handler leaves the row alone so the test only sees the reset.
        let inbound = processor(store.clone(), Arc::new(HandlerRegistry::new()));
        let id = store
            .enqueue_message(
                &NewQueueMessage::inbound("inventory", json!({}))
                    .for_host("h1")
                    .scheduled_at(chrono::Utc::now() + chrono::Duration::hours(1)),
            )
            .unwrap();
        let stale = format_timestamp(chrono::Utc::now() - chrono::Duration::seconds(35));
        store
            .with_ops(|ops| {
                ops.conn().execute(
                    "UPDATE queue_messages SET status = 'in_progress', started_at = ?1 WHERE message_id = ?2",
                    rusqlite::params![stale, id],
                )
            })
            .unwrap();

        let report = inbound.process_pending_messages().await.unwrap();
        assert_eq!(report.stuck_reset, 1);
        let msg = store.get_message(&id).unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.started_at.is_none());
    }

    #[tokio::test]
    async fn removed_host_rows_are_gone_after_one_cycle() {
        let store = store();
        store.create_host("h2", "web-02.example.com", ApprovalStatus::Approved).unwrap();
        let inbound = processor(store.clone(), Arc::new(HandlerRegistry::new()));
        let ids: Vec<String> = (0..5)
            .map(|n| {
                let msg = if n % 2 == 0 {
                    NewQueueMessage::inbound("inventory", json!({"n": n}))
                } else {
                    NewQueueMessage::outbound("command", json!({"n": n}))
                };
                store.enqueue_message(&msg.for_host("h2")).unwrap()
            })
            .collect();
        store.mark_processing(&ids[0]).unwrap();
        store.mark_processing(&ids[1]).unwrap();
        store.mark_sent(&ids[1]).unwrap();
        store.mark_failed(&ids[2], None, false).unwrap();

        assert!(store.delete_host("h2").unwrap());
        inbound.process_pending_messages().await.unwrap();
        assert_eq!(store.get_queue_stats(Some("h2"), None).unwrap().total, 0);
    }
}
