use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use wps_domain::{Stage, WorkspacePlan};

use crate::error::StoreError;

/// One status change, as stored in the permit's history list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Key layout shared by every backend:
///
/// | key | value |
/// |---|---|
/// | `permit:{id}:status` | current status string |
/// | `permit:{id}:connection` | JSON connection descriptor |
/// | `permit:{id}:history` | newest-first list of [`HistoryEntry`] JSON |
/// | `permit:{id}:plan:{stage}` | JSON-serialized [`WorkspacePlan`] |
pub mod keys {
    use wps_domain::Stage;

    pub fn status(permit_id: &str) -> String {
        format!("permit:{}:status", permit_id)
    }

    pub fn connection(permit_id: &str) -> String {
        format!("permit:{}:connection", permit_id)
    }

    pub fn history(permit_id: &str) -> String {
        format!("permit:{}:history", permit_id)
    }

    pub fn plan(permit_id: &str, stage: Stage) -> String {
        format!("permit:{}:plan:{}", permit_id, stage.as_str())
    }

    /// Prefix matching every plan key of a permit; `clear_permit` scans it.
    pub fn plan_prefix(permit_id: &str) -> String {
        format!("permit:{}:plan:", permit_id)
    }
}

/// Durable per-permit state: status, connection descriptor, status history
/// and one stored plan per stage.
///
/// A stored plan exists iff the orchestrator believes the stack exists; the
/// engine writes the plan only after a successful apply and deletes it only
/// after a successful destroy.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Persist the latest status and push a timestamped history entry.
    async fn set_status(&self, permit_id: &str, status: &str) -> Result<(), StoreError>;
    async fn get_status(&self, permit_id: &str) -> Result<Option<String>, StoreError>;

    async fn set_connection(&self, permit_id: &str, connection: &Value) -> Result<(), StoreError>;
    async fn get_connection(&self, permit_id: &str) -> Result<Option<Value>, StoreError>;

    /// Status history, newest first.
    async fn history(&self, permit_id: &str) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn set_plan(
        &self,
        permit_id: &str,
        stage: Stage,
        plan: &WorkspacePlan,
    ) -> Result<(), StoreError>;

    /// Stored plan for the stage. A value that is not valid plan JSON is
    /// treated as absent (logged, never an error).
    async fn get_plan(
        &self,
        permit_id: &str,
        stage: Stage,
    ) -> Result<Option<WorkspacePlan>, StoreError>;

    async fn delete_plan(&self, permit_id: &str, stage: Stage) -> Result<(), StoreError>;

    /// Remove every key belonging to the permit: status, connection,
    /// history and all stored plans.
    async fn clear_permit(&self, permit_id: &str) -> Result<(), StoreError>;
}

/// Decode a raw stored plan, degrading to `None` on corrupt JSON.
pub(crate) fn decode_plan(permit_id: &str, stage: Stage, raw: &str) -> Option<WorkspacePlan> {
    match serde_json::from_str(raw) {
        Ok(plan) => Some(plan),
        Err(err) => {
            tracing::warn!(
                permit_id = %permit_id,
                stage = %stage,
                error = %err,
                "stored plan is not valid JSON; treating as absent"
            );
            None
        }
    }
}
