//! Gateway error types.

use shopgate_crypto::CodecError;
use shopgate_redis::RedisError;
use shopgate_session::SessionError;
use shopgate_tenancy::TenantError;
use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Tenant resolution or connection error
    #[error(transparent)]
    Tenant(#[from] TenantError),

    /// Session store error
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Redis error
    #[error(transparent)]
    Redis(#[from] RedisError),

    /// Key ring error
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Logging could not be initialised
    #[error("Logging error: {0}")]
    Logging(String),
}

impl GatewayError {
    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tenant(e) => e.is_retryable(),
            Self::Redis(e) => e.is_retryable(),
            Self::Session(SessionError::Redis(e)) => e.is_retryable(),
            _ => false,
        }
    }
}
