// Shopgate - tenant routing and sessions for multi-tenant shop backends
//
// This library resolves the tenant behind a request, hands out that tenant's
// database connection and manages per-tenant login sessions.

pub mod config;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod shutdown;

pub use config::{ENV_PREFIX, GatewayConfig, KEY_ENV_PREFIX};
pub use error::{GatewayError, Result};
pub use gateway::{IssuedSession, ResolvedTenant, TenantCredentials, TenantGateway};
pub use logging::{LogConfig, LogFormat, init_logging};
pub use shutdown::shutdown_signal;

// Re-export member crates
pub use shopgate_crypto;
pub use shopgate_redis;
pub use shopgate_session;
pub use shopgate_tenancy;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        GatewayConfig,
        GatewayError,
        IssuedSession,
        LogConfig,
        ResolvedTenant,
        TenantGateway,
        init_logging,
        // Session types
        shopgate_session::{SessionEntry, SessionStore},
        // Tenancy types
        shopgate_tenancy::{
            AuthoritativeTenantStore, ConnectionHandle, DatabaseProvider, TenantCacheEntry,
            TenantLookup, async_trait,
        },
    };
}
