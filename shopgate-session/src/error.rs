//! Error types for session operations.

use thiserror::Error;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Session-specific errors.
///
/// A wrong token is not an error: validation returns `Ok(None)` for a
/// mismatched token exactly as for a missing session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Redis-specific error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] shopgate_redis::RedisError),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The id belongs to a live session or is still reserved by an
    /// earlier one
    #[error("Session id already used: {0}")]
    DuplicateSession(String),

    /// Session limits must allow at least one session
    #[error("Invalid session limit: {0}")]
    InvalidLimit(u32),

    /// Invalid session ID
    #[error("Invalid session ID: {0}")]
    InvalidSessionId(String),

    /// Malformed tenant or user identifier
    #[error("Invalid session owner: {0}")]
    InvalidOwner(String),
}
