//! # shopgate-redis
//!
//! Pooled Redis access for the shopgate tenant directory cache, session
//! store and tenant events.
//!
//! ## Features
//!
//! - **Connection Pooling**: bb8-managed multiplexed connections
//! - **Atomic Scripts**: Lua scripts run on a pooled connection via `EVALSHA`
//! - **Redacted Settings**: passwords never reach logs or `Debug` output
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use shopgate_redis::{RedisConfig, RedisService};
//! use std::sync::Arc;
//!
//! // SHOPGATE_REDIS_URL, SHOPGATE_REDIS_PASSWORD, ...
//! let config = RedisConfig::from_env().pool_size(32).build();
//! let redis = Arc::new(RedisService::new(config).await?);
//!
//! let mut conn = redis.get().await?;
//! ```

mod config;
mod error;
mod service;

pub use config::{REDIS_ENV_PREFIX, RedisConfig, RedisConfigBuilder};
pub use error::{RedisError, Result};
pub use service::{PoolStats, RedisConnection, RedisPool, RedisService};

// Re-export redis crate for convenience
pub use redis;
