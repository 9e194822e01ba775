use async_trait::async_trait;
use serde_json::Value;
use wps_domain::WorkspacePlan;

use crate::error::DriverError;

/// Key/value outputs captured from an apply. When the plan carries
/// connection info, it is exported under the `connection` key.
pub type ApplyOutputs = serde_json::Map<String, Value>;

/// Result of a destroy call. A stack that was never created (or was already
/// torn down) is *not* an error: destroy is re-runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed,
    NotFound,
}

/// Applies workspace plans as stacks on the container platform.
///
/// Both operations are long-running (seconds to minutes) and block the
/// event handler; the engine wraps them in a deadline. Implementations must
/// be idempotent on matching stack names: applying the same plan twice
/// converges on the same resources.
#[async_trait]
pub trait StackDriver: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// True when this driver performs no platform mutation at all. The
    /// engine observes this to log skipped execution in local dev.
    fn disabled(&self) -> bool {
        false
    }

    /// Create or update the stack named `plan.stack_name` with every
    /// resource the plan implies.
    async fn apply(&self, plan: &WorkspacePlan) -> Result<ApplyOutputs, DriverError>;

    /// Tear down the stack and all its resources.
    async fn destroy(&self, stack_name: &str) -> Result<DestroyOutcome, DriverError>;
}
