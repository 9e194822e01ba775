use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::publisher::{routing, EventPublisher};

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "SUCCESS",
            AuditOutcome::Failure => "FAILURE",
        }
    }
}

/// Drop null-valued entries; audit consumers treat absent and null alike
/// and the nulls only add noise.
fn filter_nulls(details: Map<String, Value>) -> Map<String, Value> {
    details.into_iter().filter(|(_, v)| !v.is_null()).collect()
}

/// Publishes structured audit events for centralized compliance logging.
///
/// Audit publication must never block or fail the primary operation:
/// errors are logged and swallowed.
#[derive(Clone)]
pub struct AuditPublisher {
    publisher: Arc<dyn EventPublisher>,
    routing_key: String,
}

impl AuditPublisher {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        AuditPublisher {
            publisher,
            routing_key: routing::AUDIT.to_string(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub async fn publish(
        &self,
        permit_id: &str,
        action: &str,
        outcome: AuditOutcome,
        details: Map<String, Value>,
    ) {
        let event = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "permitId": permit_id,
            "action": action,
            "outcome": outcome.as_str(),
            "details": filter_nulls(details),
        });
        if let Err(err) = self.publisher.publish(&self.routing_key, &event).await {
            warn!(
                permit_id = %permit_id,
                action = %action,
                error = %err,
                "failed to publish audit event"
            );
        }
    }
}

/// Everything a failure event carries on the bus.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub permit_id: String,
    pub action: String,
    /// The permit status recorded for this failure
    /// (`PROVISIONING_FAILED` / `DESTROY_FAILED`).
    pub status: String,
    pub workspace_type: Option<String>,
    pub stack_name: Option<String>,
    pub error_message: String,
    /// Failure category, e.g. `invalid_input`, `driver_failure`, `timeout`.
    pub error_type: String,
    pub details: Option<Map<String, Value>>,
}

/// Publishes workspace failure events on their dedicated routing keys.
///
/// Like audits, failure publication is best-effort: never re-raised.
#[derive(Clone)]
pub struct FailurePublisher {
    publisher: Arc<dyn EventPublisher>,
}

impl FailurePublisher {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        FailurePublisher { publisher }
    }

    pub async fn provisioning_failed(&self, report: FailureReport) {
        self.publish(routing::PROVISIONING_FAILED, report).await;
    }

    pub async fn destroy_failed(&self, report: FailureReport) {
        self.publish(routing::DESTROY_FAILED, report).await;
    }

    async fn publish(&self, routing_key: &str, report: FailureReport) {
        let mut event = Map::new();
        event.insert("permitId".into(), json!(report.permit_id));
        event.insert("action".into(), json!(report.action));
        event.insert("status".into(), json!(report.status));
        event.insert("workspaceType".into(), json!(report.workspace_type));
        event.insert("stackName".into(), json!(report.stack_name));
        event.insert(
            "error".into(),
            json!({"message": report.error_message, "type": report.error_type}),
        );
        if let Some(details) = report.details {
            event.insert("details".into(), json!(filter_nulls(details)));
        }
        let event = Value::Object(filter_nulls(event));

        if let Err(err) = self.publisher.publish(routing_key, &event).await {
            warn!(
                permit_id = %report.permit_id,
                action = %report.action,
                error = %err,
                "failed to publish failure event"
            );
        }
    }
}
