use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, warn};
use wps_domain::{EventType, PermitEvent, PermitStatus};

use crate::error::DecodeError;

/// Decode a raw delivery into a [`PermitEvent`].
///
/// The event type comes from `payload.type`, falling back to the
/// `x-event-type` header. Unknown permit statuses are logged and dropped to
/// `None`; the event is still dispatched, because kinds other than
/// `status.updated` ignore it.
pub fn decode_event(
    body: &[u8],
    headers: &HashMap<String, String>,
) -> Result<PermitEvent, DecodeError> {
    let payload: Value = if body.is_empty() {
        Value::Object(serde_json::Map::new())
    } else {
        serde_json::from_slice(body)?
    };

    let event_type = payload
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| headers.get("x-event-type").cloned())
        .ok_or(DecodeError::MissingEventType)?;
    let event_type = EventType::parse(&event_type)
        .map_err(|_| DecodeError::UnsupportedEventType(event_type))?;

    let permit_id = payload
        .get("permitId")
        .or_else(|| payload.get("permit_id"))
        .and_then(|v| match v {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or(DecodeError::MissingPermitId)?;

    let status = payload.get("status").and_then(Value::as_str).and_then(|raw| {
        let parsed = PermitStatus::parse(raw);
        if parsed.is_none() {
            warn!(status = %raw, "unknown permit status; dropped");
        }
        parsed
    });

    // Prefer the nested data payload; an absent or empty one means the
    // whole body is the payload.
    let event_payload = match payload.get("data") {
        Some(data) if !data.is_null() && data.as_object().map_or(true, |o| !o.is_empty()) => {
            data.clone()
        }
        _ => payload.clone(),
    };

    let event = PermitEvent {
        event_type,
        permit_id,
        status,
        payload: event_payload,
        message_id: headers.get("x-message-id").cloned(),
    };
    debug!(
        event_type = %event.event_type,
        permit_id = %event.permit_id,
        status = ?event.status,
        "parsed permit event"
    );
    Ok(event)
}
