use thiserror::Error;

/// Engine-level failures.
///
/// Driver and plan-build failures are *not* errors here; they are handled
/// in place (failure events, status writes) so the delivery can still be
/// acknowledged. Only state-store trouble propagates, rejecting the
/// delivery for an external retry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state store error: {0}")]
    Store(#[from] wps_store::StoreError),
}
