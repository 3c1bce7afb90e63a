//! In-memory session storage.
//!
//! One mutex guards records, indexes and the sequence counter, so every
//! operation is atomic within the process. Expiry runs on tokio's clock and
//! is applied lazily on access (or by [`InMemorySessionStore::cleanup_expired`]).
//! A created id stays reserved for twice `max_ttl`, so it is never reused
//! within `max_ttl` of its session ending.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::traits::{
    SessionEntry, SessionStore, check_limit, check_owner, check_session_id, check_tenant,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use shopgate_crypto::{hash_token_id, verify_token_id};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

type SessionKey = (String, String);
type UserKey = (String, String);

struct Record {
    entry: SessionEntry,
    ttl: Duration,
    created: Instant,
    deadline: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }

    /// Entry with `expires_at` derived from the deadline.
    fn snapshot(&self, now: Instant) -> SessionEntry {
        let remaining = self.deadline.saturating_duration_since(now);
        let mut entry = self.entry.clone();
        entry.expires_at = Utc::now() + chrono::Duration::from_std(remaining).unwrap_or_default();
        entry
    }
}

#[derive(Default)]
struct State {
    records: HashMap<SessionKey, Record>,
    /// Per user: sequence number -> session id
    indexes: HashMap<UserKey, BTreeMap<u64, String>>,
    /// Every id handed out, and when it may be used again
    reserved: HashMap<SessionKey, Instant>,
    next_seq: u64,
}

impl State {
    fn is_reserved(&self, key: &SessionKey, now: Instant) -> bool {
        self.reserved.get(key).is_some_and(|until| now < *until)
    }

    fn remove(&mut self, key: &SessionKey) -> Option<Record> {
        let record = self.records.remove(key)?;
        let user = (record.entry.tenant_id.clone(), record.entry.user_id.clone());
        if let Some(index) = self.indexes.get_mut(&user) {
            index.remove(&record.entry.seq);
            if index.is_empty() {
                self.indexes.remove(&user);
            }
        }
        Some(record)
    }

    /// Drop index members whose record is gone or expired.
    fn prune(&mut self, user: &UserKey, now: Instant) {
        let Some(index) = self.indexes.get(user) else {
            return;
        };
        let dead: Vec<SessionKey> = index
            .values()
            .map(|sid| (user.0.clone(), sid.clone()))
            .filter(|key| !self.records.get(key).is_some_and(|r| r.is_live(now)))
            .collect();

        for key in dead {
            if self.remove(&key).is_none()
                && let Some(index) = self.indexes.get_mut(user)
            {
                index.retain(|_, sid| *sid != key.1);
            }
        }
        if self.indexes.get(user).is_some_and(BTreeMap::is_empty) {
            self.indexes.remove(user);
        }
    }

    /// Live record for `key`; an expired one is removed on the way.
    fn live(&mut self, key: &SessionKey, now: Instant) -> Option<&mut Record> {
        if self.records.get(key).is_some_and(|r| !r.is_live(now)) {
            self.remove(key);
        }
        self.records.get_mut(key)
    }
}

/// In-memory session store.
///
/// Backs tests and single-process deployments.
pub struct InMemorySessionStore {
    config: SessionConfig,
    state: Mutex<State>,
}

impl InMemorySessionStore {
    /// Create a new in-memory session store.
    pub fn new(config: SessionConfig) -> SessionResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(State::default()),
        })
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Remove every expired session. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<SessionKey> = state
            .records
            .iter()
            .filter(|(_, record)| !record.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            state.remove(key);
        }
        state.reserved.retain(|_, until| now < *until);
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Expired sessions cleaned up");
        }
        expired.len()
    }

    /// Number of stored sessions, expired ones included until cleanup.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Whether no sessions are stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// New deadline after a sliding extension, capped at `max_ttl` from
    /// creation.
    fn extended_deadline(&self, record: &Record, now: Instant) -> Instant {
        (now + record.ttl).min(record.created + self.config.max_ttl)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
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
        let now = Instant::now();
        let key = (tenant_id.to_string(), session_id.to_string());
        let user = (tenant_id.to_string(), user_id.to_string());

        let mut state = self.state.lock();
        if state.live(&key, now).is_some() || state.is_reserved(&key, now) {
            return Err(SessionError::DuplicateSession(session_id.to_string()));
        }
        state
            .reserved
            .insert(key.clone(), now + self.config.id_reservation());

        state.next_seq += 1;
        let seq = state.next_seq;
        let created_at = Utc::now();
        state.records.insert(
            key,
            Record {
                entry: SessionEntry {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    tenant_id: tenant_id.to_string(),
                    token_hash: hash_token_id(token_id),
                    created_at,
                    expires_at: created_at + chrono::Duration::from_std(ttl).unwrap_or_default(),
                    seq,
                },
                ttl,
                created: now,
                deadline: now + ttl,
            },
        );
        state
            .indexes
            .entry(user.clone())
            .or_default()
            .insert(seq, session_id.to_string());

        state.prune(&user, now);

        let mut evicted = Vec::new();
        let live = state.indexes.get(&user).map_or(0, BTreeMap::len);
        let excess = live.saturating_sub(limit as usize);
        if excess > 0 {
            let oldest: Vec<String> = state
                .indexes
                .get(&user)
                .map(|index| index.values().take(excess).cloned().collect())
                .unwrap_or_default();
            for sid in oldest {
                state.remove(&(tenant_id.to_string(), sid.clone()));
                evicted.push(sid);
            }
        }
        drop(state);

        info!(
            tenant = %tenant_id,
            session_id = %session_id,
            evicted = evicted.len(),
            "Session created"
        );
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

        let now = Instant::now();
        let key = (tenant_id.to_string(), session_id.to_string());
        let mut state = self.state.lock();
        let Some(record) = state.live(&key, now) else {
            return Ok(None);
        };

        if !verify_token_id(token_id, &record.entry.token_hash) {
            debug!(tenant = %tenant_id, session_id = %session_id, "Session not authenticated");
            return Ok(None);
        }

        if self.config.sliding_expiration {
            record.deadline = self.extended_deadline(record, now);
        }
        Ok(Some(record.snapshot(now)))
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

        let now = Instant::now();
        let key = (tenant_id.to_string(), session_id.to_string());
        let mut state = self.state.lock();
        let Some(record) = state.live(&key, now) else {
            return Ok(None);
        };

        if !verify_token_id(presented, &record.entry.token_hash) {
            return Ok(None);
        }

        record.entry.token_hash = hash_token_id(new_token_id);
        if self.config.sliding_expiration {
            record.deadline = self.extended_deadline(record, now);
        }
        debug!(tenant = %tenant_id, session_id = %session_id, "Session token rotated");
        Ok(Some(record.snapshot(now)))
    }

    async fn revoke(&self, tenant_id: &str, session_id: &str) -> SessionResult<bool> {
        check_tenant(tenant_id)?;
        check_session_id(session_id)?;

        let key = (tenant_id.to_string(), session_id.to_string());
        let removed = self.state.lock().remove(&key).is_some();
        if removed {
            info!(tenant = %tenant_id, session_id = %session_id, "Session revoked");
        }
        Ok(removed)
    }

    async fn revoke_all(&self, tenant_id: &str, user_id: &str) -> SessionResult<usize> {
        check_owner(tenant_id, user_id)?;

        let user = (tenant_id.to_string(), user_id.to_string());
        let mut state = self.state.lock();
        let index = state.indexes.remove(&user).unwrap_or_default();
        let removed = index
            .into_values()
            .filter(|sid| {
                state
                    .records
                    .remove(&(tenant_id.to_string(), sid.clone()))
                    .is_some()
            })
            .count();
        drop(state);

        info!(tenant = %tenant_id, user = %user_id, removed, "All user sessions revoked");
        Ok(removed)
    }

    async fn sessions_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> SessionResult<Vec<SessionEntry>> {
        check_owner(tenant_id, user_id)?;

        let now = Instant::now();
        let user = (tenant_id.to_string(), user_id.to_string());
        let mut state = self.state.lock();
        state.prune(&user, now);

        let Some(index) = state.indexes.get(&user) else {
            return Ok(Vec::new());
        };
        Ok(index
            .values()
            .filter_map(|sid| state.records.get(&(tenant_id.to_string(), sid.clone())))
            .map(|record| record.snapshot(now))
            .collect())
    }
}

impl std::fmt::Debug for InMemorySessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemorySessionStore")
            .field("config", &self.config)
            .field("sessions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemorySessionStore {
        InMemorySessionStore::new(SessionConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_revoke_removes_index_entry() {
        let store = store();
        store.create("t-1", "u-1", "s-1", "k1", 3).await.unwrap();

        assert!(store.revoke("t-1", "s-1").await.unwrap());
        assert!(!store.revoke("t-1", "s-1").await.unwrap());
        assert!(store.state.lock().indexes.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_tenant_scoped() {
        let store = store();
        store.create("t-1", "u-1", "s-1", "k1", 3).await.unwrap();

        assert!(store.validate("t-2", "s-1", "k1").await.unwrap().is_none());
        assert!(store.validate("t-1", "s-1", "k1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_drops_lapsed_reservations() {
        let store = InMemorySessionStore::new(
            SessionConfig::default()
                .with_default_ttl(Duration::from_secs(60))
                .with_max_ttl(Duration::from_secs(60)),
        )
        .unwrap();
        store.create("t-1", "u-1", "s-1", "k1", 1).await.unwrap();
        store.create("t-1", "u-1", "s-2", "k2", 1).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        store.cleanup_expired();
        assert_eq!(store.state.lock().reserved.len(), 2);

        tokio::time::advance(Duration::from_secs(60)).await;
        store.cleanup_expired();
        assert!(store.state.lock().reserved.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired() {
        let store = InMemorySessionStore::new(
            SessionConfig::default().with_default_ttl(Duration::from_secs(60)),
        )
        .unwrap();
        store.create("t-1", "u-1", "s-1", "k1", 3).await.unwrap();
        store.create("t-1", "u-2", "s-2", "k2", 3).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(store.cleanup_expired(), 2);
        assert!(store.is_empty());
        assert!(store.state.lock().indexes.is_empty());
    }
}
