//! Directory Cache Backends
//!
//! The fast cache sitting in front of the authoritative tenant store.
//! Payloads and alias pointers are written together so a reader never sees
//! aliases without the payload they point at.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::tenant::LookupKey;

/// Cache provider trait
///
/// Implement this with a cache backend shared by every gateway process.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Get value from cache
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Write every entry with the same TTL, all or nothing.
    async fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration)
    -> Result<(), CacheError>;

    /// Delete keys; missing keys are ignored.
    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Cache errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Connection error: {0}")]
    Connection(String),
}

/// Builds directory cache keys under a namespace.
///
/// Payloads live at `<ns>:tenant:<id>`, alias pointers at
/// `<ns>:tenant-ref:<reference>` and `<ns>:tenant-host:<host>`.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
}

impl CacheKeyBuilder {
    /// Create a key builder for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Key for a lookup key
    ///
    /// # Examples
    ///
    /// ```
    /// use shopgate_tenancy::{CacheKeyBuilder, LookupKey};
    ///
    /// let keys = CacheKeyBuilder::new("shopgate");
    /// assert_eq!(keys.key(&LookupKey::Id("t-1".into())), "shopgate:tenant:t-1");
    /// ```
    pub fn key(&self, lookup: &LookupKey) -> String {
        if self.namespace.is_empty() {
            lookup.to_string()
        } else {
            format!("{}:{}", self.namespace, lookup)
        }
    }
}

/// Process-local cache provider.
///
/// Useful for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryCacheProvider {
    data: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl InMemoryCacheProvider {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data
            .lock()
            .values()
            .filter(|(_, deadline)| *deadline > now)
            .count()
    }

    /// Whether no live keys remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheProvider for InMemoryCacheProvider {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut data = self.data.lock();
        match data.get(key) {
            Some((value, deadline)) if *deadline > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_many(
        &self,
        entries: &[(String, Vec<u8>)],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let deadline = Instant::now() + ttl;
        let mut data = self.data.lock();
        for (key, value) in entries {
            data.insert(key.clone(), (value.clone(), deadline));
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut data = self.data.lock();
        for key in keys {
            data.remove(key);
        }
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub use self::redis_cache::RedisCacheProvider;

#[cfg(feature = "redis")]
mod redis_cache {
    use super::{CacheError, CacheProvider};
    use async_trait::async_trait;
    use shopgate_redis::{RedisService, redis};
    use std::sync::Arc;
    use std::time::Duration;

    /// Redis-backed directory cache shared across processes.
    ///
    /// Multi-key writes run in a `MULTI`/`EXEC` transaction.
    #[derive(Clone)]
    pub struct RedisCacheProvider {
        redis: Arc<RedisService>,
    }

    impl RedisCacheProvider {
        /// Create a provider over a shared Redis service
        pub fn new(redis: Arc<RedisService>) -> Self {
            Self { redis }
        }
    }

    fn backend(err: impl std::fmt::Display) -> CacheError {
        CacheError::Connection(err.to_string())
    }

    #[async_trait]
    impl CacheProvider for RedisCacheProvider {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
            let mut conn = self.redis.get().await.map_err(backend)?;
            redis::cmd("GET")
                .arg(key)
                .query_async(&mut *conn)
                .await
                .map_err(backend)
        }

        async fn set_many(
            &self,
            entries: &[(String, Vec<u8>)],
            ttl: Duration,
        ) -> Result<(), CacheError> {
            if entries.is_empty() {
                return Ok(());
            }
            let ttl_ms = ttl.as_millis().max(1) as u64;

            let mut pipe = redis::pipe();
            pipe.atomic();
            for (key, value) in entries {
                pipe.cmd("SET")
                    .arg(key)
                    .arg(value.as_slice())
                    .arg("PX")
                    .arg(ttl_ms)
                    .ignore();
            }

            let mut conn = self.redis.get().await.map_err(backend)?;
            pipe.query_async::<()>(&mut *conn).await.map_err(backend)
        }

        async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
            if keys.is_empty() {
                return Ok(());
            }
            let mut conn = self.redis.get().await.map_err(backend)?;
            redis::cmd("DEL")
                .arg(keys)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(backend)
        }
    }
}
