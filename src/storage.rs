//! Per-module status hash backed by the shared key/value+pubsub store
//! (Module E, storage half). Every mutation is pipelined with the publish
//! that announces it, so subscribers never observe a write without the
//! corresponding notification (spec.md §4.E).

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tracing::trace;

use crate::config::Config;
use crate::error::StorageError;

const NULL_SENTINEL: &str = "null";

/// Status hash for one driver module, namespaced under `config.hash_key`.
/// Cheaply cloneable: the underlying `ConnectionManager` multiplexes one
/// connection across clones.
#[derive(Clone)]
pub struct Storage {
    conn: ConnectionManager,
    hash_key: String,
    config: Config,
    module_id: String,
}

impl Storage {
    pub async fn connect(config: Config, module_id: impl Into<String>) -> Result<Self, StorageError> {
        let module_id = module_id.into();
        let client = redis::Client::open(config.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let hash_key = config.hash_key(&module_id);
        Ok(Self {
            conn,
            hash_key,
            config,
            module_id,
        })
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    fn channel(&self, status: &str) -> String {
        self.config.status_channel(&self.module_id, status)
    }

    /// Set `status` to `json`. A blank/empty value is treated as a
    /// delete, matching §4.E's "empty/blank json ⇒ delete" rule.
    pub async fn set(&self, status: &str, json: &str) -> Result<(), StorageError> {
        if json.trim().is_empty() {
            return self.delete(status).await;
        }
        let channel = self.channel(status);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.hash_key, status, json)
            .ignore()
            .publish(&channel, json)
            .ignore()
            .query_async(&mut conn)
            .await?;
        trace!(module = %self.module_id, status, "status set");
        Ok(())
    }

    pub async fn get(&self, status: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(&self.hash_key, status).await?;
        Ok(value)
    }

    /// Remove `status` and publish the literal `"null"` sentinel,
    /// atomically.
    pub async fn delete(&self, status: &str) -> Result<(), StorageError> {
        let channel = self.channel(status);
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hdel(&self.hash_key, status)
            .ignore()
            .publish(&channel, NULL_SENTINEL)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Republish the current value (or `"null"` if absent) without
    /// mutating the hash.
    pub async fn signal_status(&self, status: &str) -> Result<(), StorageError> {
        let value = self.get(status).await?;
        let payload = value.unwrap_or_else(|| NULL_SENTINEL.to_string());
        let channel = self.channel(status);
        let mut conn = self.conn.clone();
        let _: () = conn.publish(&channel, payload).await?;
        Ok(())
    }

    pub async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.hkeys(&self.hash_key).await?;
        Ok(keys)
    }

    pub async fn values(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn.hvals(&self.hash_key).await?;
        Ok(values)
    }

    pub async fn to_map(&self) -> Result<HashMap<String, String>, StorageError> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn.hgetall(&self.hash_key).await?;
        Ok(map)
    }

    pub async fn size(&self) -> Result<usize, StorageError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.hlen(&self.hash_key).await?;
        Ok(len)
    }

    pub async fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.size().await? == 0)
    }

    /// Remove every key, publishing `"null"` for each one removed.
    pub async fn clear(&self) -> Result<(), StorageError> {
        let keys = self.keys().await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
