use thiserror::Error;
use wps_domain::Stage;

/// Plan-build failures are invalid input: non-retriable, no stack mutation.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("stage {stage} requires a user but the payload has no {field}")]
    MissingUser { stage: Stage, field: &'static str },

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}
