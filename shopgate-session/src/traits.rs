//! Session store trait definition.

use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest accepted tenant, user or session identifier.
pub const MAX_ID_LEN: usize = 128;

/// One login session.
///
/// Only the hash of the current token id is kept; the raw token is handed
/// to the client and never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    /// Unique session identifier, stable across token rotation
    pub session_id: String,
    /// Owning user
    pub user_id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// One-way hash of the current token id
    pub token_hash: String,
    /// Session creation timestamp
    pub created_at: DateTime<Utc>,
    /// Session expiration timestamp
    pub expires_at: DateTime<Utc>,
    /// Creation order within the user's sessions
    pub seq: u64,
}

impl SessionEntry {
    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

impl std::fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEntry")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("tenant_id", &self.tenant_id)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

/// Session store trait for different storage backends.
///
/// Every multi-step change (insert plus index plus trim, revoke plus index
/// cleanup, token compare-and-swap) is a single atomic unit in the backing
/// store.
///
/// A wrong token and a missing session are reported the same way, as
/// `Ok(None)`, so callers cannot tell them apart.
///
/// # Examples
///
/// ```ignore
/// use shopgate_session::{SessionStore, generate_session_id};
/// use shopgate_crypto::generate_token_id;
///
/// async fn login(store: &dyn SessionStore) -> SessionResult<()> {
///     let session_id = generate_session_id();
///     let token = generate_token_id();
///
///     let evicted = store.create("t-1", "u-1", &session_id, &token, 3).await?;
///
///     let entry = store.validate("t-1", &session_id, &token).await?;
///     assert!(entry.is_some());
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create a session with an explicit TTL.
    ///
    /// The record, its index entry and the eviction of the oldest sessions
    /// beyond `limit` happen together. Returns the evicted session ids.
    ///
    /// # Errors
    ///
    /// - [`SessionError::DuplicateSession`] if the id was already used. An
    ///   id stays reserved for at least `max_ttl` after its session ends.
    /// - [`SessionError::InvalidLimit`] for a limit of zero
    async fn create_with_ttl(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        token_id: &str,
        limit: u32,
        ttl: Option<Duration>,
    ) -> SessionResult<Vec<String>>;

    /// Create a session with the default TTL.
    async fn create(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        token_id: &str,
        limit: u32,
    ) -> SessionResult<Vec<String>> {
        self.create_with_ttl(tenant_id, user_id, session_id, token_id, limit, None)
            .await
    }

    /// Check a presented token id against the session.
    ///
    /// Returns `Ok(None)` for an absent, expired or mismatched session.
    /// With sliding expiration enabled a hit extends the session.
    async fn validate(
        &self,
        tenant_id: &str,
        session_id: &str,
        token_id: &str,
    ) -> SessionResult<Option<SessionEntry>>;

    /// Replace the session's token id, keeping the session id.
    ///
    /// Succeeds only if `presented` is the current token; of two concurrent
    /// rotations with the same token exactly one wins.
    async fn rotate(
        &self,
        tenant_id: &str,
        session_id: &str,
        presented: &str,
        new_token_id: &str,
    ) -> SessionResult<Option<SessionEntry>>;

    /// Delete one session. Returns whether it existed.
    async fn revoke(&self, tenant_id: &str, session_id: &str) -> SessionResult<bool>;

    /// Delete every session of a user and the user's index.
    ///
    /// Returns the number of sessions removed.
    async fn revoke_all(&self, tenant_id: &str, user_id: &str) -> SessionResult<usize>;

    /// Live sessions of a user, oldest first.
    async fn sessions_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> SessionResult<Vec<SessionEntry>>;
}

/// Generate a new unique session ID.
pub fn generate_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Tenant and user ids become part of store keys.
pub(crate) fn check_owner(tenant_id: &str, user_id: &str) -> SessionResult<()> {
    check_tenant(tenant_id)?;
    if !is_valid_id(user_id) {
        return Err(SessionError::InvalidOwner(format!(
            "user id must be 1-{MAX_ID_LEN} characters without ':' or whitespace"
        )));
    }
    Ok(())
}

pub(crate) fn check_tenant(tenant_id: &str) -> SessionResult<()> {
    if is_valid_id(tenant_id) {
        Ok(())
    } else {
        Err(SessionError::InvalidOwner(format!(
            "tenant id must be 1-{MAX_ID_LEN} characters without ':' or whitespace"
        )))
    }
}

pub(crate) fn check_session_id(session_id: &str) -> SessionResult<()> {
    if is_valid_id(session_id) {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(format!(
            "must be 1-{MAX_ID_LEN} characters without ':' or whitespace"
        )))
    }
}

pub(crate) fn check_limit(limit: u32) -> SessionResult<()> {
    if limit == 0 {
        Err(SessionError::InvalidLimit(limit))
    } else {
        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_valid() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(check_session_id(&a).is_ok());
    }

    #[test]
    fn test_id_rules() {
        assert!(check_owner("t-1", "user@example.com").is_ok());
        assert!(check_owner("", "u").is_err());
        assert!(check_owner("t", "a:b").is_err());
        assert!(check_session_id("with space").is_err());
        assert!(check_session_id(&"x".repeat(MAX_ID_LEN + 1)).is_err());
        assert!(matches!(check_limit(0), Err(SessionError::InvalidLimit(0))));
        assert!(check_limit(1).is_ok());
    }

    #[test]
    fn test_debug_hides_token_hash() {
        let entry = SessionEntry {
            session_id: "s-1".into(),
            user_id: "u-1".into(),
            tenant_id: "t-1".into(),
            token_hash: "deadbeef".into(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            seq: 1,
        };
        assert!(!format!("{entry:?}").contains("deadbeef"));
    }
}
