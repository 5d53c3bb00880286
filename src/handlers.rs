use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{PayloadMap, QueueStore};

/// Minimal identity handed to business handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostContext {
    pub id: String,
    pub hostname: String,
}

/// Dispatch hook for inbound messages. `Ok(true)` means handled; `Ok(false)`
/// and `Err` both count as a failed attempt and go through retry.
#[async_trait]
pub trait InboundRouter: Send + Sync {
    async fn route_inbound_message(
        &self,
        message_type: &str,
        session: Arc<QueueStore>,
        host: &HostContext,
        payload: &PayloadMap,
    ) -> anyhow::Result<bool>;
}

/// Everything a handler gets for one inbound message.
#[derive(Clone)]
pub struct InboundCall {
    pub message_type: String,
    pub session: Arc<QueueStore>,
    pub host: HostContext,
    pub payload: PayloadMap,
}

/// A handler for one message type.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, call: InboundCall) -> anyhow::Result<bool>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
{
    async fn handle(&self, call: InboundCall) -> anyhow::Result<bool> {
        (self)(call).await
    }
}

/// Routes inbound messages by `message_type`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the handlers the server always carries.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("heartbeat", handle_heartbeat);
        registry
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(&mut self, message_type: impl Into<String>, handler: impl MessageHandler + 'static) {
        self.handlers.insert(message_type.into(), Arc::new(handler));
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn message_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

#[async_trait]
impl InboundRouter for HandlerRegistry {
    async fn route_inbound_message(
        &self,
        message_type: &str,
        session: Arc<QueueStore>,
        host: &HostContext,
        payload: &PayloadMap,
    ) -> anyhow::Result<bool> {
        let Some(handler) = self.handlers.get(message_type) else {
            tracing::warn!("No handler registered for inbound message type '{message_type}'");
            return Ok(false);
        };

        handler
            .handle(InboundCall {
                message_type: message_type.to_string(),
                session,
                host: host.clone(),
                payload: payload.clone(),
            })
            .await
    }
}

/// Record that the agent is alive.
pub async fn handle_heartbeat(call: InboundCall) -> anyhow::Result<bool> {
    let InboundCall { session, host, .. } = call;
    let host_id = host.id.clone();
    let touched = tokio::task::spawn_blocking(move || session.touch_host(&host_id)).await??;
    if !touched {
        tracing::warn!("Heartbeat from {} ({}) but host is gone", host.hostname, host.id);
    }
    Ok(touched)
}
