//! Tenant Records and Lookups
//!
//! Data carried by the tenant directory: the authoritative [`TenantRecord`],
//! the immutable [`TenantCacheEntry`] built from it, and the
//! [`TenantLookup`] callers resolve by.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use crate::error::{Result, TenantError};
use crate::validation::{normalize_host, validate_tenant_key};

/// Per-tenant session rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Maximum concurrent sessions per user
    pub session_limit: u32,

    /// Session lifetime in seconds
    pub session_ttl_secs: u64,
}

impl SessionPolicy {
    /// Session lifetime as a [`Duration`].
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_limit: 5,
            session_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Encrypted tenant credentials plus session policy.
///
/// Stored and cached encrypted; only the directory decrypts, on demand.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantPayload {
    /// Base64 envelope of the database connection URI
    pub encrypted_uri: String,

    /// Base64 envelopes of named secrets (API keys, signing secrets)
    #[serde(default)]
    pub encrypted_secrets: BTreeMap<String, String>,

    /// Key reference the envelopes were sealed with
    pub key_ref: String,

    /// Session rules for this tenant
    #[serde(default)]
    pub session_policy: SessionPolicy,
}

impl TenantPayload {
    /// Create a payload with no secrets and the default session policy.
    pub fn new(encrypted_uri: impl Into<String>, key_ref: impl Into<String>) -> Self {
        Self {
            encrypted_uri: encrypted_uri.into(),
            encrypted_secrets: BTreeMap::new(),
            key_ref: key_ref.into(),
            session_policy: SessionPolicy::default(),
        }
    }

    /// Add an encrypted secret
    pub fn with_secret(mut self, name: impl Into<String>, envelope: impl Into<String>) -> Self {
        self.encrypted_secrets.insert(name.into(), envelope.into());
        self
    }

    /// Set the session policy
    pub fn with_session_policy(mut self, policy: SessionPolicy) -> Self {
        self.session_policy = policy;
        self
    }
}

impl fmt::Debug for TenantPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPayload")
            .field("key_ref", &self.key_ref)
            .field("secrets", &self.encrypted_secrets.keys().collect::<Vec<_>>())
            .field("session_policy", &self.session_policy)
            .finish_non_exhaustive()
    }
}

/// Tenant as held by the authoritative store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    /// Canonical tenant identifier
    pub id: String,

    /// Public-facing reference id
    pub reference_id: String,

    /// Domains served by this tenant (normalised)
    pub hostnames: BTreeSet<String>,

    /// Encrypted credentials and policy
    pub payload: TenantPayload,

    /// Whether the tenant may be resolved
    pub active: bool,
}

impl TenantRecord {
    /// Create an active tenant with no hostnames.
    ///
    /// # Examples
    ///
    /// ```
    /// use shopgate_tenancy::{TenantPayload, TenantRecord};
    ///
    /// let record = TenantRecord::new("t-42", "acme", TenantPayload::new("ZW5j", "primary"))
    ///     .with_hostname("Shop.Acme.com:443");
    /// assert!(record.hostnames.contains("shop.acme.com"));
    /// ```
    pub fn new(
        id: impl Into<String>,
        reference_id: impl Into<String>,
        payload: TenantPayload,
    ) -> Self {
        Self {
            id: id.into(),
            reference_id: reference_id.into(),
            hostnames: BTreeSet::new(),
            payload,
            active: true,
        }
    }

    /// Add a hostname (normalised)
    pub fn with_hostname(mut self, host: impl AsRef<str>) -> Self {
        self.hostnames.insert(normalize_host(host.as_ref()));
        self
    }

    /// Set active status
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Resolved tenant as held in the directory cache.
///
/// Immutable once built; refreshes replace the whole entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantCacheEntry {
    /// Canonical tenant identifier
    pub id: String,

    /// Public-facing reference id
    pub reference_id: String,

    /// Domains served by this tenant
    pub hostnames: BTreeSet<String>,

    /// Encrypted credentials and policy
    pub payload: TenantPayload,

    /// When the entry was populated from the authoritative store
    pub fetched_at: DateTime<Utc>,
}

impl TenantCacheEntry {
    /// Build an entry from an authoritative record, stamped now.
    ///
    /// Hostnames are normalised whatever form the store returned them in.
    pub fn from_record(record: TenantRecord) -> Self {
        Self {
            id: record.id,
            reference_id: record.reference_id,
            hostnames: record
                .hostnames
                .iter()
                .map(|host| normalize_host(host))
                .collect(),
            payload: record.payload,
            fetched_at: Utc::now(),
        }
    }

    /// Whether the entry is older than `ttl`.
    pub fn is_stale(&self, ttl: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        }
    }

    /// Whether this entry is reachable through `key`.
    pub fn answers(&self, key: &LookupKey) -> bool {
        match key {
            LookupKey::Id(id) => &self.id == id,
            LookupKey::Reference(reference) => &self.reference_id == reference,
            LookupKey::Host(host) => {
                let host = normalize_host(host);
                self.hostnames.iter().any(|known| normalize_host(known) == host)
            }
        }
    }

    /// Every alias pointing at this entry.
    pub fn aliases(&self) -> Vec<LookupKey> {
        std::iter::once(LookupKey::Reference(self.reference_id.clone()))
            .chain(self.hostnames.iter().cloned().map(LookupKey::Host))
            .collect()
    }
}

/// One way of naming a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LookupKey {
    /// Canonical id
    Id(String),
    /// Public reference id
    Reference(String),
    /// Normalised hostname
    Host(String),
}

impl LookupKey {
    /// Cache entity prefix for this kind of key.
    pub fn kind(&self) -> &'static str {
        match self {
            LookupKey::Id(_) => "tenant",
            LookupKey::Reference(_) => "tenant-ref",
            LookupKey::Host(_) => "tenant-host",
        }
    }

    /// The key's value.
    pub fn value(&self) -> &str {
        match self {
            LookupKey::Id(v) | LookupKey::Reference(v) | LookupKey::Host(v) => v,
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Resolution request: one or more of id, reference id and host.
///
/// When several are given they must all name the same tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantLookup {
    pub id: Option<String>,
    pub reference_id: Option<String>,
    pub host: Option<String>,
}

impl TenantLookup {
    /// Look up by canonical id
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::default().with_id(id)
    }

    /// Look up by public reference id
    pub fn by_reference(reference_id: impl Into<String>) -> Self {
        Self::default().with_reference(reference_id)
    }

    /// Look up by hostname (e.g. a `Host` header)
    pub fn by_host(host: impl Into<String>) -> Self {
        Self::default().with_host(host)
    }

    /// Also require the canonical id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Also require the reference id
    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    /// Also require the hostname
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Validate and normalise into lookup keys, most specific first.
    pub fn keys(&self) -> Result<Vec<LookupKey>> {
        let mut keys = Vec::with_capacity(3);

        if let Some(id) = &self.id {
            validate_tenant_key(id).map_err(|e| TenantError::InvalidLookup(e.to_string()))?;
            keys.push(LookupKey::Id(id.clone()));
        }
        if let Some(reference) = &self.reference_id {
            validate_tenant_key(reference)
                .map_err(|e| TenantError::InvalidLookup(e.to_string()))?;
            keys.push(LookupKey::Reference(reference.clone()));
        }
        if let Some(host) = &self.host {
            let host = normalize_host(host);
            if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
                return Err(TenantError::InvalidLookup("malformed hostname".to_string()));
            }
            keys.push(LookupKey::Host(host));
        }

        if keys.is_empty() {
            return Err(TenantError::InvalidLookup(
                "one of id, reference id or host is required".to_string(),
            ));
        }

        Ok(keys)
    }
}
