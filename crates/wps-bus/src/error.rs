use thiserror::Error;

/// Reasons a delivery cannot become a [`wps_domain::PermitEvent`].
///
/// All of these are poison messages: rejected without requeue.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("message carries no event type (payload.type or x-event-type)")]
    MissingEventType,

    #[error("unsupported event type: {0}")]
    UnsupportedEventType(String),

    #[error("event payload missing permitId")]
    MissingPermitId,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus protocol error: {0}")]
    Protocol(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("delivery stream closed by the broker")]
    StreamClosed,
}
