//! Pooled Redis service shared by the tenant directory and session store.

use bb8::{Pool, PooledConnection};
use bb8_redis::RedisConnectionManager;
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use tracing::{debug, info};

use crate::{RedisConfig, RedisError, Result};

/// Type alias for the connection pool.
pub type RedisPool = Pool<RedisConnectionManager>;

/// A pooled Redis connection, returned to the pool on drop.
pub struct RedisConnection<'a> {
    conn: PooledConnection<'a, RedisConnectionManager>,
}

impl Deref for RedisConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for RedisConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// Pooled Redis shared by the directory cache, the session store and the
/// tenant event publisher.
///
/// Construct once at process start and share behind an `Arc`.
pub struct RedisService {
    config: RedisConfig,
    pool: RedisPool,
}

impl RedisService {
    /// Build the pool and verify connectivity with a `PING`.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        config.validate()?;
        let manager = RedisConnectionManager::new(config.connection_url()?)
            .map_err(|e| RedisError::Connection(e.to_string()))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .await
            .map_err(|e| RedisError::Pool(e.to_string()))?;

        let service = Self { config, pool };
        service.health_check().await?;

        info!(
            pool_size = service.config.pool_size,
            url = %service.config.redacted_url(),
            "Redis connection pool created"
        );
        Ok(service)
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Check a connection out of the pool.
    pub async fn get(&self) -> Result<RedisConnection<'_>> {
        let conn = self.pool.get().await?;
        Ok(RedisConnection { conn })
    }

    /// Open a standalone client for pub/sub, which cannot share pooled
    /// multiplexed connections.
    pub fn client(&self) -> Result<redis::Client> {
        redis::Client::open(self.config.connection_url()?)
            .map_err(|e| RedisError::Connection(e.to_string()))
    }

    /// Run a Lua script on a pooled connection.
    ///
    /// Uses `EVALSHA`, loading the script on first use.
    pub async fn run_script<T: redis::FromRedisValue>(
        &self,
        script: &redis::Script,
        keys: &[&str],
        args: &[String],
    ) -> Result<T> {
        let mut conn = self.get().await?;
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(arg.as_str());
        }

        match invocation.invoke_async::<T>(&mut *conn).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() => {
                Err(RedisError::Command(e))
            }
            Err(e) => {
                debug!(script = %script.get_hash(), error = %e, "Lua script failed");
                Err(RedisError::Script {
                    hash: script.get_hash().to_string(),
                    cause: e.to_string(),
                })
            }
        }
    }

    /// `PING` the server.
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.get().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

impl std::fmt::Debug for RedisService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisService")
            .field("config", &self.config)
            .field("pool", &self.pool_stats())
            .finish()
    }
}

/// Pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}
