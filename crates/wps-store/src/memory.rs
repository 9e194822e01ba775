use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use wps_domain::{Stage, WorkspacePlan};

use crate::error::StoreError;
use crate::store::{decode_plan, keys, HistoryEntry, StateStore};

#[derive(Debug, Default)]
struct Inner {
    strings: HashMap<String, String>,
    lists: HashMap<String, Vec<String>>,
}

/// In-memory implementation of [`StateStore`].
///
/// All data is lost on process exit. Suitable for tests and local
/// development with `WPS_STORE_URL=memory://`.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn set_status(&self, permit_id: &str, status: &str) -> Result<(), StoreError> {
        let entry = serde_json::to_string(&HistoryEntry {
            status: status.to_string(),
            timestamp: Utc::now(),
        })?;
        let mut guard = self.inner.write().await;
        guard
            .strings
            .insert(keys::status(permit_id), status.to_string());
        guard
            .lists
            .entry(keys::history(permit_id))
            .or_default()
            .insert(0, entry);
        Ok(())
    }

    async fn get_status(&self, permit_id: &str) -> Result<Option<String>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.strings.get(&keys::status(permit_id)).cloned())
    }

    async fn set_connection(&self, permit_id: &str, connection: &Value) -> Result<(), StoreError> {
        let raw = serde_json::to_string(connection)?;
        let mut guard = self.inner.write().await;
        guard.strings.insert(keys::connection(permit_id), raw);
        Ok(())
    }

    async fn get_connection(&self, permit_id: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.inner.read().await;
        match guard.strings.get(&keys::connection(permit_id)) {
            Some(raw) => Ok(serde_json::from_str(raw).ok()),
            None => Ok(None),
        }
    }

    async fn history(&self, permit_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let guard = self.inner.read().await;
        let entries = guard
            .lists
            .get(&keys::history(permit_id))
            .map(|items| {
                items
                    .iter()
                    .filter_map(|raw| serde_json::from_str(raw).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    async fn set_plan(
        &self,
        permit_id: &str,
        stage: Stage,
        plan: &WorkspacePlan,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(plan)?;
        let mut guard = self.inner.write().await;
        guard.strings.insert(keys::plan(permit_id, stage), raw);
        Ok(())
    }

    async fn get_plan(
        &self,
        permit_id: &str,
        stage: Stage,
    ) -> Result<Option<WorkspacePlan>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .strings
            .get(&keys::plan(permit_id, stage))
            .and_then(|raw| decode_plan(permit_id, stage, raw)))
    }

    async fn delete_plan(&self, permit_id: &str, stage: Stage) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.strings.remove(&keys::plan(permit_id, stage));
        Ok(())
    }

    async fn clear_permit(&self, permit_id: &str) -> Result<(), StoreError> {
        let prefix = keys::plan_prefix(permit_id);
        let mut guard = self.inner.write().await;
        guard.strings.remove(&keys::status(permit_id));
        guard.strings.remove(&keys::connection(permit_id));
        guard.lists.remove(&keys::history(permit_id));
        guard.strings.retain(|key, _| !key.starts_with(&prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wps_domain::{
        NetworkConfig, NetworkProfile, WorkspaceContainer, WorkspaceSpec, WorkspaceUser,
        PLAN_SCHEMA_VERSION,
    };

    fn dummy_plan(stack_name: &str) -> WorkspacePlan {
        WorkspacePlan {
            schema_version: PLAN_SCHEMA_VERSION,
            stack_name: stack_name.to_string(),
            workspace: WorkspaceSpec {
                name: "p1-ingress".into(),
                namespace: "permit-p1".into(),
                container: WorkspaceContainer {
                    image: "ghcr.io/spe/workspace-ingress:stable".into(),
                    resources: serde_json::Map::new(),
                    env: BTreeMap::new(),
                    command: None,
                    args: None,
                    ports: vec![3389],
                },
                user: WorkspaceUser {
                    username: "user-p1".into(),
                    uid: "2000".into(),
                    gid: "2000".into(),
                },
                volumes: vec![],
                service_account: None,
                replicas: 1,
                annotations: BTreeMap::new(),
            },
            network: NetworkConfig::for_profile(NetworkProfile::Ingress),
            connection_secret: None,
            connection_info: None,
            exports: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn status_and_history() {
        let store = MemoryStore::new();
        store.set_status("p1", "INGRESS").await.unwrap();
        store.set_status("p1", "PREPROCESS").await.unwrap();

        assert_eq!(store.get_status("p1").await.unwrap().as_deref(), Some("PREPROCESS"));

        let history = store.history("p1").await.unwrap();
        assert_eq!(history.len(), 2);
        // Newest first.
        assert_eq!(history[0].status, "PREPROCESS");
        assert_eq!(history[1].status, "INGRESS");
    }

    #[tokio::test]
    async fn plan_round_trip() {
        let store = MemoryStore::new();
        let plan = dummy_plan("permit-p1-ingress");
        store.set_plan("p1", Stage::Ingress, &plan).await.unwrap();

        let got = store.get_plan("p1", Stage::Ingress).await.unwrap().unwrap();
        assert_eq!(got, plan);

        store.delete_plan("p1", Stage::Ingress).await.unwrap();
        assert!(store.get_plan("p1", Stage::Ingress).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_plan_reads_as_absent() {
        let store = MemoryStore::new();
        {
            let mut guard = store.inner.write().await;
            guard
                .strings
                .insert(keys::plan("p1", Stage::Analysis), "{not json".to_string());
        }
        assert!(store.get_plan("p1", Stage::Analysis).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_permit_removes_every_key() {
        let store = MemoryStore::new();
        store.set_status("p1", "INGRESS").await.unwrap();
        store
            .set_connection("p1", &serde_json::json!({"protocol": "sftp"}))
            .await
            .unwrap();
        store
            .set_plan("p1", Stage::Ingress, &dummy_plan("permit-p1-ingress"))
            .await
            .unwrap();
        store
            .set_plan("p1", Stage::Analysis, &dummy_plan("permit-p1-analysis"))
            .await
            .unwrap();
        // An unrelated permit must survive.
        store.set_status("p2", "INGRESS").await.unwrap();

        store.clear_permit("p1").await.unwrap();

        assert!(store.get_status("p1").await.unwrap().is_none());
        assert!(store.get_connection("p1").await.unwrap().is_none());
        assert!(store.history("p1").await.unwrap().is_empty());
        assert!(store.get_plan("p1", Stage::Ingress).await.unwrap().is_none());
        assert!(store.get_plan("p1", Stage::Analysis).await.unwrap().is_none());
        assert_eq!(store.get_status("p2").await.unwrap().as_deref(), Some("INGRESS"));
    }
}
