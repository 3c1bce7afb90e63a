//! Connection Registry
//!
//! Keyed cache of live tenant database connections.
//!
//! - At most one live connection per tenant key. Concurrent callers for the
//!   same key serialize on a per-key lock; callers for different keys never
//!   block each other.
//! - Bounded: admitting a new key past `max_entries` evicts the least
//!   recently used entry and closes its connection.
//! - Failed connects are remembered for `negative_ttl` so a broken tenant
//!   does not get hammered.
//! - A background sweep drops unhealthy, idle and expired-failure entries.
//!
//! # Usage
//!
//! ```rust,ignore
//! let registry = Arc::new(ConnectionRegistry::new(Arc::new(PgProvider::new()), RegistryConfig::default())?);
//! let sweeper = registry.spawn_sweeper();
//!
//! let conn = registry.acquire("t-42", &uri).await?;
//! conn.query("SELECT 1").await?;
//!
//! registry.shutdown().await;
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{Result, TenantError};
use crate::validation::{redact_uri, validate_connection_uri, validate_tenant_key};

/// Database connection provider trait
///
/// Implement this with the database client of your choice. The registry
/// owns every connection it creates and is the only caller of
/// [`close`](DatabaseProvider::close).
#[async_trait]
pub trait DatabaseProvider: Send + Sync + 'static {
    /// The connection type (e.g. a `sqlx::PgPool` or `mongodb::Client`)
    type Connection: Send + Sync + 'static;

    /// Open a connection for `key` using `uri`.
    async fn connect(&self, key: &str, uri: &str) -> Result<Self::Connection>;

    /// Whether `conn` is still usable. Must not block.
    fn is_healthy(&self, conn: &Self::Connection) -> bool {
        let _ = conn;
        true
    }

    /// Gracefully close `conn`. Called exactly once per connection.
    async fn close(&self, key: &str, conn: &Self::Connection) {
        let _ = (key, conn);
    }
}

/// Borrowed reference to a registry-owned connection.
///
/// Cheap to clone. Dropping it does not close the connection.
pub struct ConnectionHandle<C> {
    key: Arc<str>,
    conn: Arc<C>,
}

impl<C> ConnectionHandle<C> {
    /// Tenant key this connection belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.conn, &b.conn)
    }
}

impl<C> Clone for ConnectionHandle<C> {
    fn clone(&self) -> Self {
        Self {
            key: Arc::clone(&self.key),
            conn: Arc::clone(&self.conn),
        }
    }
}

impl<C> Deref for ConnectionHandle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Observable state of a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Connecting,
    Ready,
    Failed,
    Closed,
}

/// Registry occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub entries: usize,
    pub ready: usize,
    pub connecting: usize,
    pub failed: usize,
    pub capacity: usize,
}

enum ConnectionState<C> {
    Connecting,
    Ready {
        conn: Arc<C>,
        fingerprint: u64,
        created_at: Instant,
    },
    Failed {
        cause: String,
        fingerprint: u64,
        at: Instant,
    },
    Closed,
}

impl<C> ConnectionState<C> {
    fn status(&self) -> EntryStatus {
        match self {
            ConnectionState::Connecting => EntryStatus::Connecting,
            ConnectionState::Ready { .. } => EntryStatus::Ready,
            ConnectionState::Failed { .. } => EntryStatus::Failed,
            ConnectionState::Closed => EntryStatus::Closed,
        }
    }
}

struct Entry<C> {
    state: Mutex<ConnectionState<C>>,
    /// Held for the whole of a connect attempt.
    creation: tokio::sync::Mutex<()>,
    last_used_ms: AtomicU64,
}

impl<C> Entry<C> {
    fn new(now_ms: u64) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Connecting),
            creation: tokio::sync::Mutex::new(()),
            last_used_ms: AtomicU64::new(now_ms),
        }
    }

    /// Mark closed, handing back the connection if there was one.
    fn take(&self) -> Option<Arc<C>> {
        match std::mem::replace(&mut *self.state.lock(), ConnectionState::Closed) {
            ConnectionState::Ready { conn, .. } => Some(conn),
            _ => None,
        }
    }
}

enum Lookup<C> {
    Hit(Arc<C>),
    CachedFailure(String),
    Miss,
}

/// Per-tenant connection registry
///
/// Construct once at startup, share behind an `Arc`, and call
/// [`shutdown`](Self::shutdown) on exit.
pub struct ConnectionRegistry<P: DatabaseProvider> {
    provider: Arc<P>,
    config: RegistryConfig,
    /// Most recently used first. Eviction is driven by
    /// [`make_room`](Self::make_room), not by the cache capacity.
    entries: Mutex<LruCache<String, Arc<Entry<P::Connection>>>>,
    closed: AtomicBool,
    epoch: Instant,
}

impl<P: DatabaseProvider> ConnectionRegistry<P> {
    /// Create a registry around an injected provider.
    pub fn new(provider: Arc<P>, config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            config,
            entries: Mutex::new(LruCache::unbounded()),
            closed: AtomicBool::new(false),
            epoch: Instant::now(),
        })
    }

    /// Registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the live connection for `key`, connecting with `uri` if needed.
    ///
    /// # Errors
    ///
    /// - [`TenantError::InvalidKey`] for a malformed key or URI
    /// - [`TenantError::ConnectionFailure`] if connecting failed now or
    ///   within the negative-cache window
    /// - [`TenantError::LockTimeout`] if another caller's connect for the
    ///   same key did not finish within `wait_timeout`
    /// - [`TenantError::CapacityExhausted`] if the registry is full of
    ///   entries that are all mid-connect
    /// - [`TenantError::RegistryClosed`] after shutdown
    pub async fn acquire(&self, key: &str, uri: &str) -> Result<ConnectionHandle<P::Connection>> {
        validate_tenant_key(key)?;
        validate_connection_uri(uri, &self.config.allowed_schemes)?;
        let fingerprint = fingerprint(uri);

        loop {
            if self.is_closed() {
                return Err(TenantError::RegistryClosed);
            }

            let existing = self.entries.lock().peek(key).cloned();
            if let Some(entry) = &existing {
                match self.lookup(entry, fingerprint) {
                    Lookup::Hit(conn) => {
                        self.touch(key, entry);
                        return Ok(handle(key, conn));
                    }
                    Lookup::CachedFailure(cause) => {
                        return Err(TenantError::ConnectionFailure {
                            key: key.to_string(),
                            cause,
                        });
                    }
                    Lookup::Miss => {}
                }
            }

            let entry = match existing {
                Some(entry) => entry,
                None => self.entry_for(key),
            };

            let Ok(_creation) = timeout(self.config.wait_timeout, entry.creation.lock()).await
            else {
                warn!(tenant = %key, "Timed out waiting for in-flight connection");
                return Err(TenantError::LockTimeout(key.to_string()));
            };

            if self.is_closed() {
                return Err(TenantError::RegistryClosed);
            }
            // Evicted or invalidated while we waited.
            if !self.is_current(key, &entry) {
                continue;
            }

            let stale = match self.lookup(&entry, fingerprint) {
                Lookup::Hit(conn) => {
                    self.touch(key, &entry);
                    return Ok(handle(key, conn));
                }
                Lookup::CachedFailure(cause) => {
                    return Err(TenantError::ConnectionFailure {
                        key: key.to_string(),
                        cause,
                    });
                }
                Lookup::Miss => entry.take(),
            };
            if let Some(conn) = stale {
                debug!(tenant = %key, "Replacing stale connection");
                self.provider.close(key, &conn).await;
            }
            *entry.state.lock() = ConnectionState::Connecting;

            if let Err(err) = self.make_room(key).await {
                entry.take();
                self.remove_if_current(key, &entry);
                return Err(err);
            }

            return self.connect(key, uri, fingerprint, &entry).await;
        }
    }

    /// [`acquire`](Self::acquire) with exponential backoff on retryable
    /// errors.
    ///
    /// A cached connection failure is retried no sooner than the
    /// negative-cache window allows.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        uri: &str,
    ) -> Result<ConnectionHandle<P::Connection>> {
        let policy = &self.config.retry;
        let mut attempt = 1;

        loop {
            match self.acquire(key, uri).await {
                Ok(handle) => return Ok(handle),
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let mut delay = policy.backoff(attempt);
                    if matches!(err, TenantError::ConnectionFailure { .. }) {
                        delay = delay.max(self.config.negative_ttl);
                    }
                    debug!(
                        tenant = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying acquire"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drop the entry for `key`, closing its connection.
    ///
    /// Waits for an in-flight connect to finish first. Returns whether an
    /// entry was removed.
    pub async fn invalidate(&self, key: &str) -> bool {
        let Some(entry) = self.entries.lock().pop(key) else {
            return false;
        };

        match timeout(self.config.wait_timeout, entry.creation.lock()).await {
            Ok(_creation) => {
                if let Some(conn) = entry.take() {
                    self.provider.close(key, &conn).await;
                }
            }
            Err(_) => {
                // The connect in progress sees the entry is gone and
                // closes its own result.
                warn!(tenant = %key, "Invalidated entry while connect was in flight");
            }
        }

        info!(tenant = %key, "Connection invalidated");
        true
    }

    /// Status of the entry for `key`, if any.
    pub fn status(&self, key: &str) -> Option<EntryStatus> {
        self.entries
            .lock()
            .peek(key)
            .map(|entry| entry.state.lock().status())
    }

    /// Age of the connection behind `key`, if it is ready.
    pub fn connection_age(&self, key: &str) -> Option<Duration> {
        let entries = self.entries.lock();
        let entry = entries.peek(key)?;
        let age = match &*entry.state.lock() {
            ConnectionState::Ready { created_at, .. } => Some(created_at.elapsed()),
            _ => None,
        };
        age
    }

    /// Current occupancy.
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.lock();
        let mut stats = RegistryStats {
            entries: entries.len(),
            capacity: self.config.max_entries,
            ..Default::default()
        };
        for (_, entry) in entries.iter() {
            match entry.state.lock().status() {
                EntryStatus::Ready => stats.ready += 1,
                EntryStatus::Connecting => stats.connecting += 1,
                EntryStatus::Failed => stats.failed += 1,
                EntryStatus::Closed => {}
            }
        }
        stats
    }

    /// Remove unhealthy and idle connections and expired failures.
    ///
    /// Entries with a connect in flight are skipped. Returns the number of
    /// entries removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let now_ms = self.now_ms();
        let idle_ms = self.config.idle_ttl.as_millis() as u64;

        let candidates: Vec<(String, Arc<Entry<P::Connection>>)> = self
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
            .collect();

        let mut removed = 0;
        for (key, entry) in candidates {
            let Ok(_creation) = entry.creation.try_lock() else {
                continue;
            };

            let idle = now_ms.saturating_sub(entry.last_used_ms.load(Ordering::Relaxed)) >= idle_ms;
            let doomed = match &*entry.state.lock() {
                ConnectionState::Ready { conn, .. } => idle || !self.provider.is_healthy(conn),
                ConnectionState::Failed { at, .. } => {
                    now.saturating_duration_since(*at) >= self.config.negative_ttl
                }
                ConnectionState::Connecting => idle,
                ConnectionState::Closed => true,
            };

            if doomed && self.remove_if_current(&key, &entry) {
                if let Some(conn) = entry.take() {
                    self.provider.close(&key, &conn).await;
                }
                debug!(tenant = %key, "Swept connection entry");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Connection sweep complete");
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until shutdown or
    /// until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if registry.is_closed() {
                    break;
                }
                registry.sweep().await;
            }
            debug!("Connection sweeper stopped");
        })
    }

    /// Close every connection and refuse further acquires.
    ///
    /// Connections close concurrently, bounded by `shutdown_timeout`.
    /// Returns the number of connections closed.
    pub async fn shutdown(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }

        let drained: Vec<(String, Arc<Entry<P::Connection>>)> = {
            let mut entries = self.entries.lock();
            let drained = entries
                .iter()
                .map(|(key, entry)| (key.clone(), Arc::clone(entry)))
                .collect();
            entries.clear();
            drained
        };
        let total = drained.len();
        let closed = AtomicUsize::new(0);

        let closes = drained.into_iter().map(|(key, entry)| {
            let provider = Arc::clone(&self.provider);
            let closed = &closed;
            async move {
                let _creation = entry.creation.lock().await;
                if let Some(conn) = entry.take() {
                    provider.close(&key, &conn).await;
                    closed.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        if timeout(self.config.shutdown_timeout, join_all(closes))
            .await
            .is_err()
        {
            warn!(
                entries = total,
                closed = closed.load(Ordering::Relaxed),
                "Registry shutdown timed out"
            );
        }

        let closed = closed.load(Ordering::Relaxed);
        info!(closed, "Connection registry shut down");
        closed
    }

    fn lookup(&self, entry: &Entry<P::Connection>, fingerprint: u64) -> Lookup<P::Connection> {
        match &*entry.state.lock() {
            ConnectionState::Ready {
                conn,
                fingerprint: current,
                ..
            } if *current == fingerprint && self.provider.is_healthy(conn) => {
                Lookup::Hit(Arc::clone(conn))
            }
            ConnectionState::Failed {
                cause,
                fingerprint: current,
                at,
            } if *current == fingerprint && at.elapsed() < self.config.negative_ttl => {
                Lookup::CachedFailure(cause.clone())
            }
            _ => Lookup::Miss,
        }
    }

    async fn connect(
        &self,
        key: &str,
        uri: &str,
        fingerprint: u64,
        entry: &Arc<Entry<P::Connection>>,
    ) -> Result<ConnectionHandle<P::Connection>> {
        debug!(tenant = %key, uri = %redact_uri(uri), "Connecting");
        let started = Instant::now();

        let outcome = match timeout(self.config.connect_timeout, self.provider.connect(key, uri)).await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(TenantError::ConnectionFailure { cause, .. })) => Err(cause),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {}ms",
                self.config.connect_timeout.as_millis()
            )),
        };

        match outcome {
            Ok(conn) => {
                let conn = Arc::new(conn);
                if self.is_closed() || !self.is_current(key, entry) {
                    entry.take();
                    self.provider.close(key, &conn).await;
                    return Err(if self.is_closed() {
                        TenantError::RegistryClosed
                    } else {
                        TenantError::ConnectionFailure {
                            key: key.to_string(),
                            cause: "entry invalidated during connect".to_string(),
                        }
                    });
                }

                *entry.state.lock() = ConnectionState::Ready {
                    conn: Arc::clone(&conn),
                    fingerprint,
                    created_at: Instant::now(),
                };
                self.touch(key, entry);

                info!(
                    tenant = %key,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Tenant connection ready"
                );
                Ok(handle(key, conn))
            }
            Err(cause) => {
                warn!(tenant = %key, error = %cause, "Tenant connection failed");
                *entry.state.lock() = ConnectionState::Failed {
                    cause: cause.clone(),
                    fingerprint,
                    at: Instant::now(),
                };
                Err(TenantError::ConnectionFailure {
                    key: key.to_string(),
                    cause,
                })
            }
        }
    }

    /// Evict until the map fits `max_entries`, never touching `key`.
    async fn make_room(&self, key: &str) -> Result<()> {
        loop {
            let mut candidates: Vec<(bool, String, Arc<Entry<P::Connection>>)> = {
                let entries = self.entries.lock();
                if entries.len() <= self.config.max_entries {
                    return Ok(());
                }
                entries
                    .iter()
                    .rev()
                    .filter(|(other, _)| other.as_str() != key)
                    .map(|(other, entry)| {
                        let ready = entry.state.lock().status() == EntryStatus::Ready;
                        (ready, other.clone(), Arc::clone(entry))
                    })
                    .collect()
            };
            // Dead entries first, then Ready by least recent use. The sort
            // is stable, so recency order survives within each group.
            candidates.sort_by_key(|(ready, _, _)| *ready);

            let mut evicted = false;
            for (_, victim, entry) in candidates {
                let Ok(_creation) = entry.creation.try_lock() else {
                    continue;
                };
                if !self.remove_if_current(&victim, &entry) {
                    continue;
                }
                if let Some(conn) = entry.take() {
                    self.provider.close(&victim, &conn).await;
                }
                info!(tenant = %victim, "Evicted least recently used connection");
                evicted = true;
                break;
            }

            if !evicted {
                return Err(TenantError::CapacityExhausted(self.config.max_entries));
            }
        }
    }

    fn entry_for(&self, key: &str) -> Arc<Entry<P::Connection>> {
        let now_ms = self.now_ms();
        Arc::clone(
            self.entries
                .lock()
                .get_or_insert(key.to_string(), || Arc::new(Entry::new(now_ms))),
        )
    }

    fn is_current(&self, key: &str, entry: &Arc<Entry<P::Connection>>) -> bool {
        self.entries
            .lock()
            .peek(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    fn remove_if_current(&self, key: &str, entry: &Arc<Entry<P::Connection>>) -> bool {
        let mut entries = self.entries.lock();
        if entries
            .peek(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.pop(key);
            true
        } else {
            false
        }
    }

    /// Record a use of `entry`, moving `key` to the front of the LRU order.
    fn touch(&self, key: &str, entry: &Arc<Entry<P::Connection>>) {
        entry.last_used_ms.store(self.now_ms(), Ordering::Relaxed);
        let mut entries = self.entries.lock();
        if entries
            .peek(key)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.promote(key);
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl<P: DatabaseProvider> fmt::Debug for ConnectionRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn handle<C>(key: &str, conn: Arc<C>) -> ConnectionHandle<C> {
    ConnectionHandle {
        key: Arc::from(key),
        conn,
    }
}

/// Identifies the URI an entry was opened with without retaining it.
fn fingerprint(uri: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    uri.hash(&mut hasher);
    hasher.finish()
}
