//! Request-facing facade.
//!
//! [`TenantGateway`] ties the pieces together the way a request uses them:
//! resolve the tenant from its hint, borrow that tenant's database
//! connection, then check the caller's session in the tenant's namespace.

use async_trait::async_trait;
use parking_lot::Mutex;
use shopgate_crypto::{CredentialCodec, generate_token_id};
use shopgate_redis::RedisService;
use shopgate_session::{
    InMemorySessionStore, RedisSessionStore, SessionEntry, SessionStore, generate_session_id,
};
use shopgate_tenancy::{
    AuthoritativeTenantStore, ConnectionHandle, ConnectionRegistry, DatabaseProvider,
    InMemoryCacheProvider, RedisCacheProvider, TenantCacheEntry, TenantDirectory, TenantEvent,
    TenantEventHandler, TenantLookup, spawn_tenant_event_listener,
};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::error::Result;
use crate::shutdown::shutdown_signal;

/// Decrypted tenant secrets.
///
/// `Debug` lists secret names only.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TenantCredentials {
    secrets: BTreeMap<String, String>,
}

impl TenantCredentials {
    /// Wrap decrypted secrets.
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self { secrets }
    }

    /// A secret by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    /// Names of all secrets.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    /// Number of secrets.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether there are no secrets.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("names", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Everything a request needs about its tenant.
pub struct ResolvedTenant<C> {
    /// Directory entry (credentials still encrypted)
    pub tenant: Arc<TenantCacheEntry>,
    /// Registry-owned connection; do not close it
    pub connection: ConnectionHandle<C>,
    /// Decrypted secrets
    pub credentials: TenantCredentials,
}

impl<C> fmt::Debug for ResolvedTenant<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTenant")
            .field("tenant", &self.tenant.id)
            .field("connection", &self.connection)
            .field("credentials", &self.credentials)
            .finish()
    }
}

/// A freshly issued session token.
///
/// `token` goes to the client and is never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedSession {
    /// Session identifier
    pub session_id: String,
    /// Opaque token the client presents on each request
    pub token: String,
    /// Sessions evicted to stay within the tenant's limit
    pub evicted: Vec<String>,
}

impl fmt::Debug for IssuedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedSession")
            .field("session_id", &self.session_id)
            .field("token", &"***")
            .field("evicted", &self.evicted)
            .finish()
    }
}

/// Tenant resolution, connections and sessions behind one handle.
///
/// Construct once at startup, share behind an `Arc`, and call
/// [`shutdown`](Self::shutdown) (or [`run_until_signal`](Self::run_until_signal))
/// on the way out.
pub struct TenantGateway<P: DatabaseProvider> {
    directory: Arc<TenantDirectory>,
    registry: Arc<ConnectionRegistry<P>>,
    sessions: Arc<dyn SessionStore>,
    redis: Option<Arc<RedisService>>,
    default_session_limit: u32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: DatabaseProvider> TenantGateway<P> {
    /// Assemble a gateway from already-built components.
    pub fn new(
        directory: Arc<TenantDirectory>,
        registry: Arc<ConnectionRegistry<P>>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            directory,
            registry,
            sessions,
            redis: None,
            default_session_limit: shopgate_session::SessionConfig::default().default_limit,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Single-process gateway: in-memory directory cache and sessions.
    pub fn in_memory(
        provider: Arc<P>,
        store: Arc<dyn AuthoritativeTenantStore>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(CredentialCodec::new(config.keys.build()?));

        let directory = TenantDirectory::new(
            store,
            Arc::new(InMemoryCacheProvider::new()),
            codec,
            config.directory.clone(),
        )?;
        let registry = ConnectionRegistry::new(provider, config.registry.clone())?;
        let sessions = InMemorySessionStore::new(config.session.clone())?;

        Ok(
            Self::new(Arc::new(directory), Arc::new(registry), Arc::new(sessions))
                .with_default_session_limit(config.session.default_limit),
        )
    }

    /// Redis-backed gateway: shared directory cache, sessions and tenant
    /// events across processes.
    pub async fn connect(
        provider: Arc<P>,
        store: Arc<dyn AuthoritativeTenantStore>,
        config: &GatewayConfig,
    ) -> Result<Self> {
        config.validate()?;
        let codec = Arc::new(CredentialCodec::new(config.keys.build()?));
        let redis = Arc::new(RedisService::new(config.redis.clone()).await?);

        let directory = TenantDirectory::new(
            store,
            Arc::new(RedisCacheProvider::new(Arc::clone(&redis))),
            codec,
            config.directory.clone(),
        )?;
        let registry = ConnectionRegistry::new(provider, config.registry.clone())?;
        let sessions = RedisSessionStore::new(Arc::clone(&redis), config.session.clone())?;

        let mut gateway = Self::new(Arc::new(directory), Arc::new(registry), Arc::new(sessions))
            .with_default_session_limit(config.session.default_limit);
        gateway.redis = Some(redis);
        Ok(gateway)
    }

    /// Session limit for tenants whose policy sets none (a limit of 0).
    pub fn with_default_session_limit(mut self, limit: u32) -> Self {
        self.default_session_limit = limit;
        self
    }

    /// The tenant directory.
    pub fn directory(&self) -> &Arc<TenantDirectory> {
        &self.directory
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry<P>> {
        &self.registry
    }

    /// The session store.
    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// Start background work: the registry sweeper and, when Redis backs
    /// the gateway, the tenant event listener.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut started = vec![self.registry.spawn_sweeper()];

        if let Some(redis) = &self.redis {
            let handler: Arc<dyn TenantEventHandler> = self.clone();
            let channel = self.directory.config().events_channel.clone();
            started.push(spawn_tenant_event_listener(redis, channel, handler).await?);
        }

        info!(tasks = started.len(), "Tenant gateway started");
        self.tasks.lock().extend(started);
        Ok(())
    }

    /// Resolve a tenant and borrow its database connection.
    ///
    /// Connection failures and lock timeouts are retried with backoff
    /// before being returned.
    pub async fn resolve_tenant(
        &self,
        lookup: &TenantLookup,
    ) -> Result<ResolvedTenant<P::Connection>> {
        let tenant = self.directory.resolve(lookup).await?;

        let uri = self
            .directory
            .decrypt_connection_uri(&tenant)
            .inspect_err(|e| error!(tenant = %tenant.id, error = %e, "Tenant URI unusable"))?;
        let secrets = self
            .directory
            .decrypt_secrets(&tenant)
            .inspect_err(|e| error!(tenant = %tenant.id, error = %e, "Tenant secrets unusable"))?;

        let connection = self.registry.acquire_with_retry(&tenant.id, &uri).await?;

        debug!(tenant = %tenant.id, "Tenant resolved");
        Ok(ResolvedTenant {
            tenant,
            connection,
            credentials: TenantCredentials::new(secrets),
        })
    }

    /// Start a session for `user_id` under the tenant's session policy.
    pub async fn login(&self, tenant: &TenantCacheEntry, user_id: &str) -> Result<IssuedSession> {
        let policy = &tenant.payload.session_policy;
        let limit = match policy.session_limit {
            0 => self.default_session_limit,
            limit => limit,
        };

        let session_id = generate_session_id();
        let token = generate_token_id();
        let evicted = self
            .sessions
            .create_with_ttl(
                &tenant.id,
                user_id,
                &session_id,
                &token,
                limit,
                Some(policy.session_ttl()),
            )
            .await?;

        Ok(IssuedSession {
            session_id,
            token,
            evicted,
        })
    }

    /// Check a presented session token.
    ///
    /// `None` means "not authenticated", whatever the reason.
    pub async fn authenticate(
        &self,
        tenant_id: &str,
        session_id: &str,
        token: &str,
    ) -> Result<Option<SessionEntry>> {
        Ok(self.sessions.validate(tenant_id, session_id, token).await?)
    }

    /// Replace the session's token; the session id is kept.
    pub async fn refresh(
        &self,
        tenant_id: &str,
        session_id: &str,
        token: &str,
    ) -> Result<Option<IssuedSession>> {
        let fresh = generate_token_id();
        let rotated = self
            .sessions
            .rotate(tenant_id, session_id, token, &fresh)
            .await?;

        Ok(rotated.map(|entry| IssuedSession {
            session_id: entry.session_id,
            token: fresh,
            evicted: Vec::new(),
        }))
    }

    /// End one session.
    pub async fn logout(&self, tenant_id: &str, session_id: &str) -> Result<bool> {
        Ok(self.sessions.revoke(tenant_id, session_id).await?)
    }

    /// End every session of a user.
    pub async fn logout_everywhere(&self, tenant_id: &str, user_id: &str) -> Result<usize> {
        Ok(self.sessions.revoke_all(tenant_id, user_id).await?)
    }

    /// Forget everything cached about a tenant in this process: directory
    /// entry and live connection.
    pub async fn invalidate_tenant(&self, tenant_id: &str) -> Result<()> {
        let cached = self.directory.invalidate(tenant_id).await;
        self.registry.invalidate(tenant_id).await;
        cached.map_err(Into::into)
    }

    /// Stop background tasks and close every tenant connection.
    ///
    /// Returns the number of connections closed.
    pub async fn shutdown(&self) -> usize {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.registry.shutdown().await
    }

    /// Wait for SIGINT or SIGTERM, then [`shutdown`](Self::shutdown).
    pub async fn run_until_signal(&self) -> usize {
        shutdown_signal().await;
        self.shutdown().await
    }
}

#[async_trait]
impl<P: DatabaseProvider> TenantEventHandler for TenantGateway<P> {
    async fn handle(&self, event: &TenantEvent) {
        if let Err(e) = self.invalidate_tenant(event.tenant_id()).await {
            warn!(tenant = %event.tenant_id(), error = %e, "Tenant event handling failed");
        }
    }
}

impl<P: DatabaseProvider> fmt::Debug for TenantGateway<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantGateway")
            .field("directory", &self.directory)
            .field("registry", &self.registry.stats())
            .field("redis", &self.redis.is_some())
            .finish_non_exhaustive()
    }
}
