use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use wps_domain::PermitEvent;

use crate::error::BusError;

/// Outbound routing keys.
pub mod routing {
    pub const AUDIT: &str = "audit.workspace.event";
    pub const PROVISIONING_FAILED: &str = "permit.workspace.provisioning_failed";
    pub const DESTROY_FAILED: &str = "permit.workspace.destroy_failed";
}

/// Publishes JSON messages on the shared events exchange.
#[async_trait]
pub trait EventPublisher: Send + Sync + 'static {
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), BusError>;
}

/// Handles decoded permit events. Implemented by the lifecycle engine; a
/// handler error rejects the delivery without requeue.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: PermitEvent) -> anyhow::Result<()>;
}

/// Publisher that records messages in memory. For tests and local dev.
#[derive(Debug, Default)]
pub struct MemoryPublisher {
    messages: Mutex<Vec<(String, Value)>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All published `(routing_key, payload)` pairs, in order.
    pub async fn messages(&self) -> Vec<(String, Value)> {
        self.messages.lock().await.clone()
    }

    /// Payloads published under one routing key.
    pub async fn on_key(&self, routing_key: &str) -> Vec<Value> {
        self.messages
            .lock()
            .await
            .iter()
            .filter(|(key, _)| key == routing_key)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, routing_key: &str, payload: &Value) -> Result<(), BusError> {
        self.messages
            .lock()
            .await
            .push((routing_key.to_string(), payload.clone()));
        Ok(())
    }
}
