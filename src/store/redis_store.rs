use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};

use crate::{AtomicScript, QuotaGuardError, StoreClient};

/// [`StoreClient`] backed by Redis.
///
/// Holds one or more [`ConnectionManager`]s and hands them out round-robin.
/// Admission scripts are sent with `EVALSHA`; the `redis` crate reloads a
/// script transparently when the server answers `NOSCRIPT`.
///
/// # Requirements
///
/// - **Redis version:** >= 4.0 (multi-field `HSET`)
/// - **Runtime:** Tokio
pub struct RedisStore {
    connection_managers: Arc<Vec<ConnectionManager>>,
    track_index: AtomicUsize,
    scripts: Arc<DashMap<&'static str, Script>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connection_managers", &self.connection_managers.len())
            .field("track_index", &self.track_index)
            .field("scripts", &self.scripts)
            .finish()
    }
}

impl RedisStore {
    /// Create a new [`RedisStore`] with a single connection manager.
    pub async fn default_from_client(client: Client) -> Result<Self, QuotaGuardError> {
        Self::from_client(client, 1).await
    }

    /// Create a new [`RedisStore`] with `connection_count` connection managers.
    pub async fn from_client(
        client: Client,
        connection_count: usize,
    ) -> Result<Self, QuotaGuardError> {
        if connection_count == 0 {
            return Err(QuotaGuardError::InvalidConnectionCount(
                "Connection count must be at least 1".to_string(),
            ));
        }

        let mut connection_managers = Vec::with_capacity(connection_count);

        for _ in 0..connection_count {
            connection_managers.push(client.get_connection_manager().await?);
        }

        Ok(Self::from_connection_managers(connection_managers))
    }

    /// Wrap already established connection managers.
    ///
    /// Callers must pass at least one manager.
    pub fn from_connection_managers(connection_managers: Vec<ConnectionManager>) -> Self {
        Self {
            connection_managers: Arc::new(connection_managers),
            track_index: AtomicUsize::new(0),
            scripts: Arc::new(DashMap::new()),
        }
    }

    fn connection(&self) -> Result<ConnectionManager, QuotaGuardError> {
        if self.connection_managers.is_empty() {
            return Err(QuotaGuardError::StoreUnavailable(
                "no redis connection managers configured".to_string(),
            ));
        }

        let index = self.track_index.fetch_add(1, Ordering::Relaxed);
        Ok(self.connection_managers[index % self.connection_managers.len()].clone())
    } // end method connection

    fn script(&self, script: &AtomicScript) -> Script {
        self.scripts
            .entry(script.name())
            .or_insert_with(|| Script::new(script.body()))
            .clone()
    }
}

impl Clone for RedisStore {
    fn clone(&self) -> Self {
        Self {
            connection_managers: self.connection_managers.clone(),
            track_index: AtomicUsize::new(0),
            scripts: self.scripts.clone(),
        }
    }
}

impl StoreClient for RedisStore {
    async fn atomic_script(&self, script: &AtomicScript) -> Result<i64, QuotaGuardError> {
        let redis_script = self.script(script);
        let mut invocation = redis_script.prepare_invoke();

        for key in script.keys() {
            invocation.key(key);
        }

        for arg in script.args() {
            invocation.arg(arg);
        }

        let mut connection_manager = self.connection()?;
        let reply: i64 = invocation.invoke_async(&mut connection_manager).await?;

        Ok(reply)
    }

    async fn increment(&self, key: &str) -> Result<i64, QuotaGuardError> {
        let mut connection_manager = self.connection()?;
        let value: i64 = connection_manager.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool, QuotaGuardError> {
        let ttl_seconds = i64::try_from(ttl_seconds).unwrap_or(i64::MAX);
        let mut connection_manager = self.connection()?;
        let updated: bool = connection_manager.expire(key, ttl_seconds).await?;
        Ok(updated)
    }

    async fn delete(&self, key: &str) -> Result<bool, QuotaGuardError> {
        let mut connection_manager = self.connection()?;
        let removed: u64 = connection_manager.del(key).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<u64, QuotaGuardError> {
        let mut connection_manager = self.connection()?;
        let count: u64 = connection_manager.zcard(key).await?;
        Ok(count)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, QuotaGuardError> {
        let mut connection_manager = self.connection()?;
        let value: Option<String> = connection_manager.hget(key, field).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, QuotaGuardError> {
        let mut connection_manager = self.connection()?;
        let value: Option<String> = connection_manager.get(key).await?;
        Ok(value)
    }
}
