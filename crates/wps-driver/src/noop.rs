use async_trait::async_trait;
use tracing::debug;
use wps_domain::WorkspacePlan;

use crate::driver::{ApplyOutputs, DestroyOutcome, StackDriver};
use crate::error::DriverError;

/// A driver that performs no platform mutation.
///
/// Selected with `WPS_DISABLE_DRIVER=true`; the engine records state as
/// usual so the read API stays meaningful in local development.
#[derive(Debug, Default, Clone)]
pub struct NoopDriver;

impl NoopDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StackDriver for NoopDriver {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn disabled(&self) -> bool {
        true
    }

    async fn apply(&self, plan: &WorkspacePlan) -> Result<ApplyOutputs, DriverError> {
        debug!(stack = %plan.stack_name, "NoopDriver: apply skipped");
        let mut outputs = ApplyOutputs::new();
        if let Some(connection) = &plan.connection_info {
            outputs.insert("connection".to_string(), connection.clone());
        }
        Ok(outputs)
    }

    async fn destroy(&self, stack_name: &str) -> Result<DestroyOutcome, DriverError> {
        debug!(stack = %stack_name, "NoopDriver: destroy skipped");
        Ok(DestroyOutcome::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use wps_domain::{
        NetworkConfig, NetworkProfile, WorkspaceContainer, WorkspaceSpec, WorkspaceUser,
        PLAN_SCHEMA_VERSION,
    };

    fn dummy_plan() -> WorkspacePlan {
        WorkspacePlan {
            schema_version: PLAN_SCHEMA_VERSION,
            stack_name: "permit-p1-review".into(),
            workspace: WorkspaceSpec {
                name: "p1-review".into(),
                namespace: "permit-p1".into(),
                container: WorkspaceContainer {
                    image: "ghcr.io/spe/workspace-hdab-review:stable".into(),
                    resources: serde_json::Map::new(),
                    env: BTreeMap::new(),
                    command: None,
                    args: None,
                    ports: vec![3389],
                },
                user: WorkspaceUser {
                    username: "alice".into(),
                    uid: "1000".into(),
                    gid: "1000".into(),
                },
                volumes: vec![],
                service_account: None,
                replicas: 1,
                annotations: BTreeMap::new(),
            },
            network: NetworkConfig::for_profile(NetworkProfile::Review),
            connection_secret: None,
            connection_info: Some(json!({"protocol": "rdp"})),
            exports: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn apply_exports_connection() {
        let driver = NoopDriver::new();
        let outputs = driver.apply(&dummy_plan()).await.unwrap();
        assert_eq!(outputs["connection"]["protocol"], "rdp");
    }

    #[tokio::test]
    async fn destroy_is_not_found() {
        let driver = NoopDriver::new();
        assert_eq!(
            driver.destroy("permit-p1-review").await.unwrap(),
            DestroyOutcome::NotFound
        );
        assert!(driver.disabled());
    }
}
