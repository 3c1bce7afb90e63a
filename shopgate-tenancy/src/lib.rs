//! Tenant Connections and Directory for shopgate
//!
//! Routes every request to the right tenant database with minimal latency.
//!
//! # Features
//!
//! - **Connection Registry** - at most one live connection per tenant,
//!   bounded LRU, negative caching of failed connects, background sweep
//! - **Tenant Directory** - resolve by id, reference id or hostname through a
//!   shared cache with a single authoritative fetch per miss
//! - **Encrypted Credentials** - connection URIs and secrets stay encrypted
//!   until the moment they are used
//! - **Tenant Events** - cross-process invalidation over Redis pub/sub
//!
//! # Quick Start
//!
//! ## 1. Implement a database provider
//!
//! ```rust,ignore
//! use shopgate_tenancy::*;
//!
//! struct PgProvider;
//!
//! #[async_trait]
//! impl DatabaseProvider for PgProvider {
//!     type Connection = sqlx::PgPool;
//!
//!     async fn connect(&self, key: &str, uri: &str) -> Result<Self::Connection> {
//!         sqlx::PgPool::connect(uri).await.map_err(|e| TenantError::ConnectionFailure {
//!             key: key.to_string(),
//!             cause: e.to_string(),
//!         })
//!     }
//!
//!     fn is_healthy(&self, pool: &Self::Connection) -> bool {
//!         !pool.is_closed()
//!     }
//!
//!     async fn close(&self, _key: &str, pool: &Self::Connection) {
//!         pool.close().await;
//!     }
//! }
//! ```
//!
//! ## 2. Resolve and connect
//!
//! ```rust,ignore
//! let directory = TenantDirectory::new(store, cache, codec, DirectoryConfig::default())?;
//! let registry = Arc::new(ConnectionRegistry::new(Arc::new(PgProvider), RegistryConfig::default())?);
//!
//! let tenant = directory.resolve(&TenantLookup::by_host(host_header)).await?;
//! let uri = directory.decrypt_connection_uri(&tenant)?;
//! let pool = registry.acquire(&tenant.id, &uri).await?;
//! ```

pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod events;
pub mod registry;
pub mod store;
pub mod tenant;
pub mod validation;

pub use async_trait::async_trait;
pub use cache::{CacheError, CacheKeyBuilder, CacheProvider, InMemoryCacheProvider};
#[cfg(feature = "redis")]
pub use cache::RedisCacheProvider;
pub use config::{DEFAULT_SCHEMES, DirectoryConfig, RegistryConfig, RetryPolicy};
pub use directory::TenantDirectory;
pub use error::{Result, TenantError};
pub use events::{TenantEvent, TenantEventHandler};
#[cfg(feature = "redis")]
pub use events::{TenantEventPublisher, spawn_tenant_event_listener};
pub use registry::{
    ConnectionHandle, ConnectionRegistry, DatabaseProvider, EntryStatus, RegistryStats,
};
pub use store::{AuthoritativeTenantStore, InMemoryTenantStore};
pub use tenant::{
    LookupKey, SessionPolicy, TenantCacheEntry, TenantLookup, TenantPayload, TenantRecord,
};
pub use validation::{normalize_host, redact_uri, validate_connection_uri, validate_tenant_key};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::CacheProvider;
    pub use crate::directory::TenantDirectory;
    pub use crate::error::TenantError;
    pub use crate::registry::{ConnectionHandle, ConnectionRegistry, DatabaseProvider};
    pub use crate::store::AuthoritativeTenantStore;
    pub use crate::tenant::{TenantCacheEntry, TenantLookup};
}
