use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    #[error("destroy failed: {0}")]
    DestroyFailed(String),

    #[error("internal driver error: {0}")]
    Internal(String),
}
