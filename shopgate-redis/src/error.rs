//! Redis error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RedisError>;

/// Failures talking to the shared Redis.
#[derive(Debug, Error)]
pub enum RedisError {
    /// The server could not be reached or refused the handshake.
    #[error("Redis connection error: {0}")]
    Connection(String),

    /// Building the pool failed.
    #[error("Redis pool error: {0}")]
    Pool(String),

    /// No pooled connection became free in time.
    #[error("Timed out waiting for a Redis connection")]
    Timeout,

    #[error("Redis configuration error: {0}")]
    Config(String),

    /// A Lua script failed on the server.
    #[error("Redis script {hash} failed: {cause}")]
    Script { hash: String, cause: String },

    /// Any other command failure.
    #[error("Redis command error: {0}")]
    Command(#[from] redis::RedisError),
}

impl RedisError {
    /// Whether the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_) | Self::Timeout => true,
            Self::Command(err) => {
                err.is_io_error() || err.is_timeout() || err.is_connection_dropped()
            }
            Self::Pool(_) | Self::Config(_) | Self::Script { .. } => false,
        }
    }
}

impl<E> From<bb8::RunError<E>> for RedisError
where
    E: std::error::Error + 'static,
{
    fn from(err: bb8::RunError<E>) -> Self {
        match err {
            bb8::RunError::TimedOut => Self::Timeout,
            bb8::RunError::User(e) => Self::Connection(e.to_string()),
        }
    }
}
