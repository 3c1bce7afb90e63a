//! Tenancy errors.

use shopgate_crypto::CodecError;

/// Result type for tenancy operations.
pub type Result<T> = std::result::Result<T, TenantError>;

/// Errors raised by the connection registry and the tenant directory.
#[derive(Debug, thiserror::Error)]
pub enum TenantError {
    /// Malformed tenant key or connection URI. Never reaches I/O.
    #[error("Invalid tenant key or URI: {0}")]
    InvalidKey(String),

    /// Connecting to the tenant database failed (negative-cached).
    #[error("Connection to tenant {key} failed: {cause}")]
    ConnectionFailure { key: String, cause: String },

    /// The authoritative store has no such tenant.
    #[error("Tenant not found: {0}")]
    NotFound(String),

    /// Waited too long for another caller's in-flight connection.
    #[error("Tenant {0} is temporarily unavailable, retry later")]
    LockTimeout(String),

    /// The registry has been shut down.
    #[error("Connection registry is closed")]
    RegistryClosed,

    /// Every slot is busy and nothing can be evicted.
    #[error("Connection registry is at capacity ({0} entries)")]
    CapacityExhausted(usize),

    /// No lookup key, or lookup keys that disagree.
    #[error("Invalid tenant lookup: {0}")]
    InvalidLookup(String),

    /// The tenant exists but is deactivated.
    #[error("Tenant is inactive: {0}")]
    Inactive(String),

    /// Invalid configuration, or tenant credentials that cannot be
    /// decrypted. Not retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Directory cache backend error.
    #[error("Cache error: {0}")]
    Cache(String),

    /// Authoritative store error.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl TenantError {
    /// Whether the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TenantError::LockTimeout(_)
                | TenantError::ConnectionFailure { .. }
                | TenantError::CapacityExhausted(_)
        )
    }
}

impl From<CodecError> for TenantError {
    fn from(err: CodecError) -> Self {
        TenantError::Config(err.to_string())
    }
}

impl From<crate::cache::CacheError> for TenantError {
    fn from(err: crate::cache::CacheError) -> Self {
        TenantError::Cache(err.to_string())
    }
}
