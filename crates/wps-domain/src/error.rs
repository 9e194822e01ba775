use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown permit status: {0}")]
    UnknownStatus(String),

    #[error("unknown workspace stage: {0}")]
    UnknownStage(String),
}
