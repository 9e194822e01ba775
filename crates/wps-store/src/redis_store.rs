use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::debug;
use wps_domain::{Stage, WorkspacePlan};

use crate::error::StoreError;
use crate::store::{decode_plan, keys, HistoryEntry, StateStore};

/// Redis-backed implementation of [`StateStore`].
///
/// Uses a [`ConnectionManager`], which multiplexes one connection and
/// transparently reconnects, so transient broker hiccups never surface as
/// process-fatal errors.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(RedisStore { conn })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn set_status(&self, permit_id: &str, status: &str) -> Result<(), StoreError> {
        debug!(permit_id = %permit_id, status = %status, "setting workspace status");
        let entry = serde_json::to_string(&HistoryEntry {
            status: status.to_string(),
            timestamp: Utc::now(),
        })?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::status(permit_id), status).await?;
        let _: () = conn.lpush(keys::history(permit_id), entry).await?;
        Ok(())
    }

    async fn get_status(&self, permit_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let status: Option<String> = conn.get(keys::status(permit_id)).await?;
        Ok(status)
    }

    async fn set_connection(&self, permit_id: &str, connection: &Value) -> Result<(), StoreError> {
        debug!(permit_id = %permit_id, "saving connection details");
        let raw = serde_json::to_string(connection)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::connection(permit_id), raw).await?;
        Ok(())
    }

    async fn get_connection(&self, permit_id: &str) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::connection(permit_id)).await?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    tracing::warn!(
                        permit_id = %permit_id,
                        error = %err,
                        "stored connection details are invalid JSON"
                    );
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn history(&self, permit_id: &str) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(keys::history(permit_id), 0, -1).await?;
        Ok(items
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect())
    }

    async fn set_plan(
        &self,
        permit_id: &str,
        stage: Stage,
        plan: &WorkspacePlan,
    ) -> Result<(), StoreError> {
        debug!(permit_id = %permit_id, stage = %stage, "persisting workspace plan");
        let raw = serde_json::to_string(plan)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::plan(permit_id, stage), raw).await?;
        Ok(())
    }

    async fn get_plan(
        &self,
        permit_id: &str,
        stage: Stage,
    ) -> Result<Option<WorkspacePlan>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::plan(permit_id, stage)).await?;
        Ok(raw.and_then(|raw| decode_plan(permit_id, stage, &raw)))
    }

    async fn delete_plan(&self, permit_id: &str, stage: Stage) -> Result<(), StoreError> {
        debug!(permit_id = %permit_id, stage = %stage, "deleting workspace plan");
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys::plan(permit_id, stage)).await?;
        Ok(())
    }

    async fn clear_permit(&self, permit_id: &str) -> Result<(), StoreError> {
        let mut keys_to_delete = vec![
            keys::status(permit_id),
            keys::connection(permit_id),
            keys::history(permit_id),
        ];

        // Plan keys are discovered by prefix scan; the stage set may grow.
        let pattern = format!("{}*", keys::plan_prefix(permit_id));
        let mut conn = self.conn.clone();
        {
            let mut iter: redis::AsyncIter<'_, String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys_to_delete.push(key);
            }
        }

        debug!(permit_id = %permit_id, keys = keys_to_delete.len(), "clearing permit state");
        let mut conn = self.conn.clone();
        let _: () = conn.del(keys_to_delete).await?;
        Ok(())
    }
}
