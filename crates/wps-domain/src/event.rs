use serde_json::Value;

use crate::error::DomainError;
use crate::types::PermitStatus;

// ── Event types ───────────────────────────────────────────────────────────────

/// Event kinds published on the permit-event routing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    StatusUpdated,
    IngressInitiated,
    StopRequested,
    StartRequested,
    Deleted,
}

impl EventType {
    /// The routing key / `type` field this event kind travels under.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StatusUpdated => "permit.status.updated",
            EventType::IngressInitiated => "permit.ingress.initiated",
            EventType::StopRequested => "permit.workspace.stop_requested",
            EventType::StartRequested => "permit.workspace.start_requested",
            EventType::Deleted => "permit.deleted",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "permit.status.updated" => Ok(EventType::StatusUpdated),
            "permit.ingress.initiated" => Ok(EventType::IngressInitiated),
            "permit.workspace.stop_requested" => Ok(EventType::StopRequested),
            "permit.workspace.start_requested" => Ok(EventType::StartRequested),
            "permit.deleted" => Ok(EventType::Deleted),
            other => Err(DomainError::UnknownEventType(other.to_string())),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Permit event ──────────────────────────────────────────────────────────────

/// A permit lifecycle event as received from the message bus.
///
/// The payload is schemaless; the plan builder validates and overlays
/// defaults field-by-field rather than binding a rigid schema.
#[derive(Debug, Clone)]
pub struct PermitEvent {
    pub event_type: EventType,
    pub permit_id: String,
    /// Present only for `permit.status.updated`; unknown wire statuses are
    /// dropped to `None` at decode time.
    pub status: Option<PermitStatus>,
    pub payload: Value,
    pub message_id: Option<String>,
}

impl PermitEvent {
    pub fn new(event_type: EventType, permit_id: impl Into<String>) -> Self {
        PermitEvent {
            event_type,
            permit_id: permit_id.into(),
            status: None,
            payload: Value::Null,
            message_id: None,
        }
    }

    pub fn with_status(mut self, status: PermitStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Payload viewed as an object; absent or non-object payloads read as
    /// an empty map.
    pub fn payload_object(&self) -> serde_json::Map<String, Value> {
        self.payload
            .as_object()
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_round_trips() {
        for ty in [
            EventType::StatusUpdated,
            EventType::IngressInitiated,
            EventType::StopRequested,
            EventType::StartRequested,
            EventType::Deleted,
        ] {
            assert_eq!(EventType::parse(ty.as_str()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        assert!(EventType::parse("permit.renamed").is_err());
    }

    #[test]
    fn non_object_payload_reads_as_empty() {
        let event = PermitEvent::new(EventType::Deleted, "p1");
        assert!(event.payload_object().is_empty());
    }
}
