//! Cache-backed developer key lookups.
//!
//! Entries are JSON encoded and shared through a [`CacheBackend`]: Redis in
//! production, an in-process map in tests and single-node setups.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, Client};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::ServiceError;
use super::store::Stores;
use crate::models::account::{global_id_for, SHARD_ID_FACTOR};
use crate::models::{DeveloperKey, DeveloperKeyAccountBinding, DeveloperKeyId, ShardId};

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<(), anyhow::Error>;
    async fn delete(&self, key: &str) -> Result<(), anyhow::Error>;
    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisCache {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisCache {
    pub async fn new(config: &crate::config::RedisConfig) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get cache: {}", e))
    }

    async fn set(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expiry_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set cache: {}", e))
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to delete cache entry: {}", e))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// Process-local cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.value().1 > Instant::now())
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let hit = self
            .entries
            .get(key)
            .filter(|entry| entry.value().1 > Instant::now())
            .map(|entry| entry.value().0.clone());
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &str, expiry_seconds: u64) -> Result<(), anyhow::Error> {
        let expires_at = Instant::now() + Duration::from_secs(expiry_seconds);
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries.remove(key);
        Ok(())
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

pub fn developer_key_cache_key(global_id: i64) -> String {
    format!("developer_key/{}", global_id)
}

pub fn vendor_code_cache_key(vendor_code: &str) -> String {
    format!("developer_keys/{}", vendor_code)
}

pub fn site_admin_binding_cache_key(global_id: i64) -> String {
    format!("developer_key_account_binding/site_admin/{}", global_id)
}

/// Read-through cache for keys and the site admin binding.
pub struct DeveloperKeyCache {
    backend: Arc<dyn CacheBackend>,
    stores: Stores,
    home_shard: ShardId,
    ttl_seconds: u64,
}

impl DeveloperKeyCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        stores: Stores,
        home_shard: ShardId,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            backend,
            stores,
            home_shard,
            ttl_seconds,
        }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Find a key by local or global id. A key that does not exist is an
    /// error, not `None`.
    pub async fn find_cached(&self, id: DeveloperKeyId) -> Result<DeveloperKey, ServiceError> {
        let global_id = if id >= SHARD_ID_FACTOR {
            id
        } else {
            global_id_for(self.home_shard, id)
        };
        let local_id = global_id % SHARD_ID_FACTOR;

        let developer_keys = &self.stores.developer_keys;
        self.fetch(&developer_key_cache_key(global_id), || {
            developer_keys.find_key(local_id)
        })
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("DeveloperKey {}", global_id)))
    }

    pub async fn by_cached_vendor_code(
        &self,
        vendor_code: &str,
    ) -> Result<Vec<DeveloperKey>, ServiceError> {
        let developer_keys = &self.stores.developer_keys;
        self.fetch(&vendor_code_cache_key(vendor_code), || {
            developer_keys.find_keys_by_vendor_code(vendor_code)
        })
        .await
    }

    /// Explicitly set binding of a site admin key on the site admin account.
    /// Misses are cached too.
    pub async fn find_site_admin_cached(
        &self,
        key: &DeveloperKey,
    ) -> Result<Option<DeveloperKeyAccountBinding>, ServiceError> {
        if !key.is_site_admin_owned() {
            return Ok(None);
        }

        let stores = &self.stores;
        self.fetch(&site_admin_binding_cache_key(key.global_id()), || async move {
            let site_admin = stores.accounts.site_admin().await?;
            let binding = stores.bindings.find_binding(key.id, site_admin.id).await?;
            Ok(binding.filter(DeveloperKeyAccountBinding::is_explicitly_set))
        })
        .await
    }

    /// Drop the key's id and vendor code entries.
    pub async fn clear(&self, key: &DeveloperKey) {
        self.evict(&developer_key_cache_key(key.global_id())).await;
        if let Some(vendor_code) = key.vendor_code.as_deref().filter(|code| !code.is_empty()) {
            self.evict(&vendor_code_cache_key(vendor_code)).await;
        }
    }

    pub async fn clear_site_admin_binding(&self, key: &DeveloperKey) {
        self.evict(&site_admin_binding_cache_key(key.global_id()))
            .await;
    }

    async fn evict(&self, cache_key: &str) {
        if let Err(e) = self.backend.delete(cache_key).await {
            tracing::warn!(cache_key = %cache_key, error = %e, "Failed to evict cache entry");
        }
    }

    async fn fetch<T, F, Fut>(&self, cache_key: &str, loader: F) -> Result<T, ServiceError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        match self.backend.get(cache_key).await {
            Ok(Some(cached)) => match serde_json::from_str(&cached) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(cache_key = %cache_key, error = %e, "Discarding undecodable cache entry")
                }
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(cache_key = %cache_key, error = %e, "Cache read failed, loading from store")
            }
        }

        let value = loader().await?;
        let encoded = serde_json::to_string(&value)?;
        if let Err(e) = self
            .backend
            .set(cache_key, &encoded, self.ttl_seconds)
            .await
        {
            tracing::warn!(cache_key = %cache_key, error = %e, "Failed to populate cache entry");
        }
        Ok(value)
    }
}
