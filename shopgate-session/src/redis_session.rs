//! Redis session storage implementation.
//!
//! Each session is a hash under `<ns>:session:<tenant>:<session>`; each user
//! has a sorted set `<ns>:user-sessions:<tenant>:<user>` scored by a
//! per-user sequence number. All multi-key changes run as Lua scripts so
//! the records and the index never disagree. Creating a session also
//! reserves its id under `<ns>:session-used:<tenant>:<session>` for twice
//! `max_ttl`, so an id stays unusable for at least `max_ttl` after it was
//! revoked, evicted or expired.
//!
//! The scripts build record keys from a prefix argument, so they are not
//! Redis Cluster safe.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::traits::{
    SessionEntry, SessionStore, check_limit, check_owner, check_session_id, check_tenant,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shopgate_crypto::{hash_token_id, verify_token_id};
use shopgate_redis::{RedisError, RedisService, redis};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Insert, index and trim in one step.
///
/// KEYS: record, index, seq, id reservation.
/// ARGV: session id, user id, tenant id, token hash, created ms, expires ms,
/// ttl ms, limit, record prefix, index ttl ms, reservation ms.
const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1
  or not redis.call('SET', KEYS[4], '1', 'NX', 'PX', ARGV[11]) then
  return false
end
local seq = redis.call('INCR', KEYS[3])
redis.call('HSET', KEYS[1],
  'session_id', ARGV[1], 'user_id', ARGV[2], 'tenant_id', ARGV[3],
  'token_hash', ARGV[4], 'created_at', ARGV[5], 'expires_at', ARGV[6],
  'ttl_ms', ARGV[7], 'seq', seq)
redis.call('PEXPIRE', KEYS[1], ARGV[7])
redis.call('ZADD', KEYS[2], seq, ARGV[1])

for _, sid in ipairs(redis.call('ZRANGE', KEYS[2], 0, -1)) do
  if redis.call('EXISTS', ARGV[9] .. sid) == 0 then
    redis.call('ZREM', KEYS[2], sid)
  end
end

local evicted = {}
local excess = redis.call('ZCARD', KEYS[2]) - tonumber(ARGV[8])
if excess > 0 then
  for _, sid in ipairs(redis.call('ZRANGE', KEYS[2], 0, excess - 1)) do
    redis.call('DEL', ARGV[9] .. sid)
    redis.call('ZREM', KEYS[2], sid)
    table.insert(evicted, sid)
  end
end

redis.call('PEXPIRE', KEYS[2], ARGV[10])
redis.call('PEXPIRE', KEYS[3], ARGV[10])
return evicted
";

/// Compare-and-swap of the token hash.
///
/// KEYS: record. ARGV: expected hash, new hash, expires ms or '', ttl ms.
const ROTATE_SCRIPT: &str = r"
if redis.call('HGET', KEYS[1], 'token_hash') ~= ARGV[1] then
  return 0
end
redis.call('HSET', KEYS[1], 'token_hash', ARGV[2])
if ARGV[3] ~= '' then
  redis.call('HSET', KEYS[1], 'expires_at', ARGV[3])
  redis.call('PEXPIRE', KEYS[1], ARGV[4])
end
return 1
";

/// Sliding extension that never recreates a deleted record.
///
/// KEYS: record. ARGV: expires ms, ttl ms.
const TOUCH_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'expires_at', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
";

/// KEYS: record. ARGV: index prefix, session id.
const REVOKE_SCRIPT: &str = r"
local user = redis.call('HGET', KEYS[1], 'user_id')
if not user then
  return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', ARGV[1] .. user, ARGV[2])
return 1
";

/// KEYS: index. ARGV: record prefix.
const REVOKE_ALL_SCRIPT: &str = r"
local removed = 0
for _, sid in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
  removed = removed + redis.call('DEL', ARGV[1] .. sid)
end
redis.call('DEL', KEYS[1])
return removed
";

struct Scripts {
    create: redis::Script,
    rotate: redis::Script,
    touch: redis::Script,
    revoke: redis::Script,
    revoke_all: redis::Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            create: redis::Script::new(CREATE_SCRIPT),
            rotate: redis::Script::new(ROTATE_SCRIPT),
            touch: redis::Script::new(TOUCH_SCRIPT),
            revoke: redis::Script::new(REVOKE_SCRIPT),
            revoke_all: redis::Script::new(REVOKE_ALL_SCRIPT),
        }
    }
}

/// Redis-backed session store.
///
/// # Examples
///
/// ```no_run
/// use shopgate_redis::{RedisConfig, RedisService};
/// use shopgate_session::{RedisSessionStore, SessionConfig, SessionStore};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let redis = Arc::new(RedisService::new(RedisConfig::from_env().build()).await?);
///     let store = RedisSessionStore::new(redis, SessionConfig::default())?;
///
///     let evicted = store.create("t-1", "u-1", "s-1", "token", 3).await?;
///     assert!(evicted.is_empty());
///     Ok(())
/// }
/// ```
pub struct RedisSessionStore {
    redis: Arc<RedisService>,
    config: SessionConfig,
    scripts: Scripts,
}

impl RedisSessionStore {
    /// Create a new Redis session store.
    pub fn new(redis: Arc<RedisService>, config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            redis,
            config,
            scripts: Scripts::load(),
        })
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn load(&self, key: &str) -> SessionResult<Option<StoredSession>> {
        let mut conn = self.redis.get().await?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut *conn)
            .await
            .map_err(RedisError::from)?;

        if fields.is_empty() {
            return Ok(None);
        }
        StoredSession::from_fields(&fields).map(Some)
    }

    async fn touch(&self, key: &str, stored: &mut StoredSession) -> SessionResult<bool> {
        let expires_at =
            self.config
                .extended_expiry(stored.entry.created_at, stored.ttl, Utc::now());
        let touched: i64 = self
            .redis
            .run_script(
                &self.scripts.touch,
                &[key],
                &[
                    expires_at.timestamp_millis().to_string(),
                    remaining_ms(expires_at).to_string(),
                ],
            )
            .await?;

        if touched == 1 {
            stored.entry.expires_at = expires_at;
        }
        Ok(touched == 1)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create_with_ttl(
        &self,
        tenant_id: &str,
        user_id: &str,
        session_id: &str,
        token_id: &str,
        limit: u32,
        ttl: Option<Duration>,
    ) -> SessionResult<Vec<String>> {
        check_owner(tenant_id, user_id)?;
        check_session_id(session_id)?;
        check_limit(limit)?;

        let ttl = self.config.effective_ttl(ttl);
        let created_at = Utc::now();
        let expires_at = created_at + chrono::Duration::from_std(ttl).unwrap_or_default();

        let record = self.config.session_key(tenant_id, session_id);
        let index = self.config.index_key(tenant_id, user_id);
        let seq = self.config.seq_key(tenant_id, user_id);
        let reservation = self.config.used_id_key(tenant_id, session_id);

        let evicted: Option<Vec<String>> = self
            .redis
            .run_script(
                &self.scripts.create,
                &[&record, &index, &seq, &reservation],
                &[
                    session_id.to_string(),
                    user_id.to_string(),
                    tenant_id.to_string(),
                    hash_token_id(token_id),
                    created_at.timestamp_millis().to_string(),
                    expires_at.timestamp_millis().to_string(),
                    duration_ms(ttl).to_string(),
                    limit.to_string(),
                    self.config.session_key_prefix(tenant_id),
                    duration_ms(self.config.max_ttl).to_string(),
                    duration_ms(self.config.id_reservation()).to_string(),
                ],
            )
            .await?;

        let evicted =
            evicted.ok_or_else(|| SessionError::DuplicateSession(session_id.to_string()))?;

        info!(
            tenant = %tenant_id,
            session_id = %session_id,
            evicted = evicted.len(),
            "Session created"
        );
        if !evicted.is_empty() {
            debug!(tenant = %tenant_id, evicted = ?evicted, "Oldest sessions evicted over limit");
        }
        Ok(evicted)
    }

    async fn validate(
        &self,
        tenant_id: &str,
        session_id: &str,
        token_id: &str,
    ) -> SessionResult<Option<SessionEntry>> {
        if check_tenant(tenant_id).is_err() || check_session_id(session_id).is_err() {
            return Ok(None);
        }

        let key = self.config.session_key(tenant_id, session_id);
        let Some(mut stored) = self.load(&key).await? else {
            return Ok(None);
        };

        if stored.entry.tenant_id != tenant_id
            || stored.entry.is_expired()
            || !verify_token_id(token_id, &stored.entry.token_hash)
        {
            debug!(tenant = %tenant_id, session_id = %session_id, "Session not authenticated");
            return Ok(None);
        }

        if self.config.sliding_expiration && !self.touch(&key, &mut stored).await? {
            // Revoked between the read and the extension.
            return Ok(None);
        }

        Ok(Some(stored.entry))
    }

    async fn rotate(
        &self,
        tenant_id: &str,
        session_id: &str,
        presented: &str,
        new_token_id: &str,
    ) -> SessionResult<Option<SessionEntry>> {
        if check_tenant(tenant_id).is_err() || check_session_id(session_id).is_err() {
            return Ok(None);
        }

        let key = self.config.session_key(tenant_id, session_id);
        let Some(mut stored) = self.load(&key).await? else {
            return Ok(None);
        };

        if stored.entry.is_expired() || !verify_token_id(presented, &stored.entry.token_hash) {
            return Ok(None);
        }

        let new_hash = hash_token_id(new_token_id);
        let (expires_arg, ttl_arg) = if self.config.sliding_expiration {
            let expires_at =
                self.config
                    .extended_expiry(stored.entry.created_at, stored.ttl, Utc::now());
            stored.entry.expires_at = expires_at;
            (
                expires_at.timestamp_millis().to_string(),
                remaining_ms(expires_at).to_string(),
            )
        } else {
            (String::new(), String::new())
        };

        // The stored hash was just checked in constant time; the script only
        // guards against a concurrent rotation replacing it.
        let swapped: i64 = self
            .redis
            .run_script(
                &self.scripts.rotate,
                &[&key],
                &[
                    stored.entry.token_hash.clone(),
                    new_hash.clone(),
                    expires_arg,
                    ttl_arg,
                ],
            )
            .await?;

        if swapped != 1 {
            debug!(tenant = %tenant_id, session_id = %session_id, "Lost token rotation race");
            return Ok(None);
        }

        stored.entry.token_hash = new_hash;
        debug!(tenant = %tenant_id, session_id = %session_id, "Session token rotated");
        Ok(Some(stored.entry))
    }

    async fn revoke(&self, tenant_id: &str, session_id: &str) -> SessionResult<bool> {
        check_tenant(tenant_id)?;
        check_session_id(session_id)?;

        let key = self.config.session_key(tenant_id, session_id);
        let removed: i64 = self
            .redis
            .run_script(
                &self.scripts.revoke,
                &[&key],
                &[
                    self.config.index_key_prefix(tenant_id),
                    session_id.to_string(),
                ],
            )
            .await?;

        if removed == 1 {
            info!(tenant = %tenant_id, session_id = %session_id, "Session revoked");
        }
        Ok(removed == 1)
    }

    async fn revoke_all(&self, tenant_id: &str, user_id: &str) -> SessionResult<usize> {
        check_owner(tenant_id, user_id)?;

        let index = self.config.index_key(tenant_id, user_id);
        let removed: usize = self
            .redis
            .run_script(
                &self.scripts.revoke_all,
                &[&index],
                &[self.config.session_key_prefix(tenant_id)],
            )
            .await?;

        info!(tenant = %tenant_id, user = %user_id, removed, "All user sessions revoked");
        Ok(removed)
    }

    async fn sessions_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> SessionResult<Vec<SessionEntry>> {
        check_owner(tenant_id, user_id)?;

        let index = self.config.index_key(tenant_id, user_id);
        let session_ids: Vec<String> = {
            let mut conn = self.redis.get().await?;
            redis::cmd("ZRANGE")
                .arg(&index)
                .arg(0)
                .arg(-1)
                .query_async(&mut *conn)
                .await
                .map_err(RedisError::from)?
        };

        let mut sessions = Vec::with_capacity(session_ids.len());
        for session_id in session_ids {
            let key = self.config.session_key(tenant_id, &session_id);
            if let Some(stored) = self.load(&key).await?
                && !stored.entry.is_expired()
            {
                sessions.push(stored.entry);
            }
        }
        sessions.sort_by_key(|entry| entry.seq);
        Ok(sessions)
    }
}

impl std::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A session hash plus the TTL it was created with.
struct StoredSession {
    entry: SessionEntry,
    ttl: Duration,
}

impl StoredSession {
    fn from_fields(fields: &HashMap<String, String>) -> SessionResult<Self> {
        let text = |name: &str| -> SessionResult<String> {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| SessionError::Deserialization(format!("missing field {name}")))
        };
        let number = |name: &str| -> SessionResult<i64> {
            text(name)?
                .parse()
                .map_err(|_| SessionError::Deserialization(format!("invalid field {name}")))
        };
        let timestamp = |name: &str| -> SessionResult<DateTime<Utc>> {
            Utc.timestamp_millis_opt(number(name)?)
                .single()
                .ok_or_else(|| SessionError::Deserialization(format!("invalid field {name}")))
        };

        Ok(Self {
            entry: SessionEntry {
                session_id: text("session_id")?,
                user_id: text("user_id")?,
                tenant_id: text("tenant_id")?,
                token_hash: text("token_hash")?,
                created_at: timestamp("created_at")?,
                expires_at: timestamp("expires_at")?,
                seq: u64::try_from(number("seq")?).unwrap_or_default(),
            },
            ttl: Duration::from_millis(u64::try_from(number("ttl_ms")?).unwrap_or_default()),
        })
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn remaining_ms(expires_at: DateTime<Utc>) -> i64 {
    (expires_at - Utc::now()).num_milliseconds().max(1)
}
