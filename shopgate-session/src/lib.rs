//! Login sessions for shopgate tenants.
//!
//! Every tenant has its own session namespace. A user may hold a bounded
//! number of concurrent sessions; creating one more silently evicts the
//! oldest, in the same atomic step as the insert.
//!
//! Tokens are opaque random strings handed to the client. Only their
//! one-way hash is stored, and validation compares hashes in constant time.
//! A wrong token looks exactly like a missing session: `Ok(None)`.
//!
//! # Features
//!
//! - `redis` - Redis session storage (enabled by default)
//!
//! # Examples
//!
//! ## Redis Session Store (Default)
//!
//! ```no_run
//! use shopgate_crypto::generate_token_id;
//! use shopgate_redis::{RedisConfig, RedisService};
//! use shopgate_session::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let redis = Arc::new(RedisService::new(RedisConfig::from_env().build()).await?);
//!     let config = SessionConfig::default().with_default_ttl(Duration::from_secs(3600));
//!     let store = RedisSessionStore::new(redis, config)?;
//!
//!     // Login: at most 3 concurrent sessions for this user
//!     let session_id = generate_session_id();
//!     let token = generate_token_id();
//!     store.create("t-1", "u-1", &session_id, &token, 3).await?;
//!
//!     // Later requests
//!     if let Some(session) = store.validate("t-1", &session_id, &token).await? {
//!         println!("user {}", session.user_id);
//!     }
//!
//!     // Refresh keeps the session id, replaces the token
//!     let fresh = generate_token_id();
//!     store.rotate("t-1", &session_id, &token, &fresh).await?;
//!
//!     // Logout
//!     store.revoke("t-1", &session_id).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## In-Memory Session Store
//!
//! ```
//! use shopgate_session::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = InMemorySessionStore::new(SessionConfig::default()).unwrap();
//!
//! for (sid, token) in [("s1", "k1"), ("s2", "k2"), ("s3", "k3")] {
//!     store.create("t-1", "u-1", sid, token, 2).await.unwrap();
//! }
//!
//! // s1 was evicted to keep the user at two sessions
//! assert!(store.validate("t-1", "s1", "k1").await.unwrap().is_none());
//! assert!(store.validate("t-1", "s3", "k3").await.unwrap().is_some());
//! # }
//! ```

pub mod config;
pub mod error;
pub mod memory_session;
pub mod traits;

#[cfg(feature = "redis")]
pub mod redis_session;

pub use config::SessionConfig;
pub use error::{SessionError, SessionResult};
pub use memory_session::InMemorySessionStore;
pub use traits::{MAX_ID_LEN, SessionEntry, SessionStore, generate_session_id};

#[cfg(feature = "redis")]
pub use redis_session::RedisSessionStore;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::error::{SessionError, SessionResult};
    pub use crate::memory_session::InMemorySessionStore;
    pub use crate::traits::{SessionEntry, SessionStore, generate_session_id};

    #[cfg(feature = "redis")]
    pub use crate::redis_session::RedisSessionStore;
}
