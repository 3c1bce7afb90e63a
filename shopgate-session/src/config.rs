//! Session configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SessionError, SessionResult};

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Key prefix for session records and indexes
    pub namespace: String,
    /// Session TTL when the caller does not give one
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    /// Absolute session lifetime; sliding extension never passes it
    #[serde(with = "duration_secs")]
    pub max_ttl: Duration,
    /// Concurrent sessions per user when the tenant sets no limit
    pub default_limit: u32,
    /// Extend a session's expiry on every successful validation
    pub sliding_expiration: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: "shopgate".to_string(),
            default_ttl: Duration::from_secs(3600),     // 1 hour
            max_ttl: Duration::from_secs(86400 * 30), // 30 days
            default_limit: 5,
            sliding_expiration: true,
        }
    }
}

impl SessionConfig {
    /// Set the session namespace/prefix.
    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the default session TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the maximum session TTL.
    pub fn with_max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = ttl;
        self
    }

    /// Set the default per-user session limit.
    pub fn with_default_limit(mut self, limit: u32) -> Self {
        self.default_limit = limit;
        self
    }

    /// Enable or disable sliding expiration.
    pub fn with_sliding_expiration(mut self, sliding: bool) -> Self {
        self.sliding_expiration = sliding;
        self
    }

    /// Record key of one session: `<ns>:session:<tenant>:<session>`.
    pub fn session_key(&self, tenant_id: &str, session_id: &str) -> String {
        format!("{}{}", self.session_key_prefix(tenant_id), session_id)
    }

    /// Prefix shared by every session record of a tenant.
    pub fn session_key_prefix(&self, tenant_id: &str) -> String {
        self.prefixed(&format!("session:{tenant_id}:"))
    }

    /// Ordered session index of one user: `<ns>:user-sessions:<tenant>:<user>`.
    pub fn index_key(&self, tenant_id: &str, user_id: &str) -> String {
        format!("{}{}", self.index_key_prefix(tenant_id), user_id)
    }

    /// Prefix shared by every user index of a tenant.
    pub fn index_key_prefix(&self, tenant_id: &str) -> String {
        self.prefixed(&format!("user-sessions:{tenant_id}:"))
    }

    /// Sequence counter of one user, the eviction order of its sessions.
    pub fn seq_key(&self, tenant_id: &str, user_id: &str) -> String {
        self.prefixed(&format!("user-sessions-seq:{tenant_id}:{user_id}"))
    }

    /// Reservation of a session id once used:
    /// `<ns>:session-used:<tenant>:<session>`.
    pub fn used_id_key(&self, tenant_id: &str, session_id: &str) -> String {
        self.prefixed(&format!("session-used:{tenant_id}:{session_id}"))
    }

    /// How long a created session id stays reserved. A session lives at most
    /// `max_ttl`, so the id outlasts it by at least `max_ttl`.
    pub fn id_reservation(&self) -> Duration {
        self.max_ttl.saturating_mul(2)
    }

    fn prefixed(&self, rest: &str) -> String {
        if self.namespace.is_empty() {
            rest.to_string()
        } else {
            format!("{}:{rest}", self.namespace)
        }
    }

    /// Check invariants.
    pub fn validate(&self) -> SessionResult<()> {
        if self.default_ttl.is_zero() {
            return Err(SessionError::Config(
                "default_ttl must be greater than zero".to_string(),
            ));
        }
        if self.max_ttl < self.default_ttl {
            return Err(SessionError::Config(
                "max_ttl must not be shorter than default_ttl".to_string(),
            ));
        }
        if self.default_limit == 0 {
            return Err(SessionError::InvalidLimit(0));
        }
        Ok(())
    }

    /// TTL for a new session: the requested one, or the default, capped at
    /// `max_ttl`.
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.default_ttl)
            .min(self.max_ttl)
    }

    /// Expiry after a sliding extension at `now`.
    pub fn extended_expiry(
        &self,
        created_at: DateTime<Utc>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let slide = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        let cap = created_at + chrono::Duration::from_std(self.max_ttl).unwrap_or_default();
        slide.min(cap)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
