//! Tenant Directory
//!
//! Resolves a tenant by canonical id, reference id or hostname.
//!
//! Lookups go to the shared cache first. Alias keys (reference id, host)
//! only hold the canonical id; the payload lives under the id alone, so
//! every path resolves to the same entry. On a miss the authoritative store
//! is queried once per key (concurrent misses wait for the first fetch) and
//! the payload plus every alias are written with the same TTL.
//!
//! Credentials stay encrypted in the cache and in the returned entry;
//! decrypt them with [`TenantDirectory::decrypt_connection_uri`].

use parking_lot::Mutex;
use shopgate_crypto::CredentialCodec;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheKeyBuilder, CacheProvider};
use crate::config::DirectoryConfig;
use crate::error::{Result, TenantError};
use crate::store::AuthoritativeTenantStore;
use crate::tenant::{LookupKey, TenantCacheEntry, TenantLookup};

/// Cached, stampede-guarded tenant resolution.
pub struct TenantDirectory {
    store: Arc<dyn AuthoritativeTenantStore>,
    cache: Arc<dyn CacheProvider>,
    codec: Arc<CredentialCodec>,
    config: DirectoryConfig,
    keys: CacheKeyBuilder,
    inflight: Mutex<HashMap<LookupKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl TenantDirectory {
    /// Create a directory over injected store, cache and codec.
    pub fn new(
        store: Arc<dyn AuthoritativeTenantStore>,
        cache: Arc<dyn CacheProvider>,
        codec: Arc<CredentialCodec>,
        config: DirectoryConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            cache,
            codec,
            keys: CacheKeyBuilder::new(config.namespace.clone()),
            config,
            inflight: Mutex::new(HashMap::new()),
        })
    }

    /// Directory configuration.
    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    /// Resolve a tenant.
    ///
    /// # Errors
    ///
    /// - [`TenantError::InvalidLookup`] when no key is given, a key is
    ///   malformed, or the given keys name different tenants
    /// - [`TenantError::NotFound`] when the authoritative store has no match
    /// - [`TenantError::Inactive`] for a deactivated tenant
    /// - [`TenantError::Storage`] when the authoritative store fails
    pub async fn resolve(&self, lookup: &TenantLookup) -> Result<Arc<TenantCacheEntry>> {
        let keys = lookup.keys()?;
        let (primary, others) = keys
            .split_first()
            .ok_or_else(|| TenantError::InvalidLookup("empty lookup".to_string()))?;

        let entry = self.resolve_key(primary).await?;

        if let Some(conflict) = others.iter().find(|key| !entry.answers(key)) {
            return Err(TenantError::InvalidLookup(format!(
                "{conflict} does not belong to tenant {}",
                entry.id
            )));
        }

        Ok(entry)
    }

    /// Resolve by a single lookup key.
    pub async fn resolve_key(&self, key: &LookupKey) -> Result<Arc<TenantCacheEntry>> {
        if let Some(entry) = self.read_cache(key).await {
            debug!(lookup = %key, tenant = %entry.id, "Tenant directory hit");
            return Ok(entry);
        }

        let gate = self.gate(key);
        let result = {
            let _fetching = gate.lock().await;
            match self.read_cache(key).await {
                Some(entry) => Ok(entry),
                None => self.fetch_and_populate(key).await,
            }
        };
        self.release_gate(key, &gate);

        result
    }

    /// Drop the cached payload and alias pointers for tenant `id`.
    pub async fn invalidate(&self, id: &str) -> Result<()> {
        let id_key = LookupKey::Id(id.to_string());
        let mut doomed = vec![self.keys.key(&id_key)];

        if let Some(entry) = self.read_payload(id).await {
            doomed.extend(entry.aliases().iter().map(|alias| self.keys.key(alias)));
        }

        self.cache.delete_many(&doomed).await?;
        info!(tenant = %id, keys = doomed.len(), "Tenant directory entry invalidated");
        Ok(())
    }

    /// Decrypt the tenant's database connection URI.
    ///
    /// Fails with [`TenantError::Config`] if the envelope cannot be opened.
    pub fn decrypt_connection_uri(&self, entry: &TenantCacheEntry) -> Result<String> {
        self.codec
            .decrypt_to_string(&entry.payload.encrypted_uri, &entry.payload.key_ref)
            .map_err(|e| {
                warn!(tenant = %entry.id, error = %e, "Tenant connection URI failed to decrypt");
                TenantError::from(e)
            })
    }

    /// Decrypt every named secret of the tenant.
    pub fn decrypt_secrets(&self, entry: &TenantCacheEntry) -> Result<BTreeMap<String, String>> {
        entry
            .payload
            .encrypted_secrets
            .iter()
            .map(|(name, envelope)| -> Result<(String, String)> {
                let value = self
                    .codec
                    .decrypt_to_string(envelope, &entry.payload.key_ref)?;
                Ok((name.clone(), value))
            })
            .collect()
    }

    async fn fetch_and_populate(&self, key: &LookupKey) -> Result<Arc<TenantCacheEntry>> {
        let record = self
            .store
            .find(key)
            .await?
            .ok_or_else(|| TenantError::NotFound(key.to_string()))?;

        if !record.active {
            return Err(TenantError::Inactive(record.id));
        }

        let entry = Arc::new(TenantCacheEntry::from_record(record));
        self.populate(&entry).await;

        info!(lookup = %key, tenant = %entry.id, "Tenant directory populated from store");
        Ok(entry)
    }

    /// Write payload and aliases together; on failure remove whatever may
    /// have landed.
    async fn populate(&self, entry: &TenantCacheEntry) {
        let payload = match serde_json::to_vec(entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(tenant = %entry.id, error = %e, "Failed to serialize tenant entry");
                return;
            }
        };

        let mut writes = vec![(self.keys.key(&LookupKey::Id(entry.id.clone())), payload)];
        for alias in entry.aliases() {
            writes.push((self.keys.key(&alias), entry.id.as_bytes().to_vec()));
        }

        if let Err(e) = self.cache.set_many(&writes, self.config.entry_ttl).await {
            warn!(tenant = %entry.id, error = %e, "Failed to populate tenant directory cache");
            let keys: Vec<String> = writes.into_iter().map(|(key, _)| key).collect();
            if let Err(e) = self.cache.delete_many(&keys).await {
                warn!(tenant = %entry.id, error = %e, "Failed to discard partial cache entry");
            }
        }
    }

    /// Alias pointer and payload must both be present, fresh and agree.
    async fn read_cache(&self, key: &LookupKey) -> Option<Arc<TenantCacheEntry>> {
        let id = match key {
            LookupKey::Id(id) => id.clone(),
            alias => {
                let raw = self.cache_get(&self.keys.key(alias)).await?;
                String::from_utf8(raw).ok()?
            }
        };

        let entry = self.read_payload(&id).await?;
        if !entry.answers(key) {
            debug!(lookup = %key, tenant = %id, "Stale alias pointer");
            return None;
        }
        Some(Arc::new(entry))
    }

    async fn read_payload(&self, id: &str) -> Option<TenantCacheEntry> {
        let raw = self
            .cache_get(&self.keys.key(&LookupKey::Id(id.to_string())))
            .await?;

        let entry: TenantCacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(tenant = %id, error = %e, "Discarding unreadable tenant cache entry");
                return None;
            }
        };

        if entry.id != id || entry.is_stale(self.config.entry_ttl) {
            return None;
        }
        Some(entry)
    }

    /// Cache read where backend errors count as misses.
    async fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        match self.cache.get(key).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key = %key, error = %e, "Tenant cache read failed, falling back to store");
                None
            }
        }
    }

    fn gate(&self, key: &LookupKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.inflight.lock().entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &LookupKey, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock();
        // Only the map and this caller still hold it.
        if inflight
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(gate) == 2)
        {
            inflight.remove(key);
        }
    }
}

impl std::fmt::Debug for TenantDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantDirectory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheProvider;
    use crate::store::InMemoryTenantStore;
    use crate::tenant::{TenantPayload, TenantRecord};
    use shopgate_crypto::KeyRing;

    fn directory() -> (TenantDirectory, Arc<InMemoryTenantStore>) {
        let codec = Arc::new(CredentialCodec::new(
            KeyRing::new().with_key("primary", [1u8; 32]),
        ));
        let uri = codec
            .encrypt_to_string("postgres://shop:pw@db/acme", "primary")
            .unwrap();

        let store = Arc::new(InMemoryTenantStore::new());
        store.upsert(
            TenantRecord::new("t-1", "acme", TenantPayload::new(uri, "primary"))
                .with_hostname("acme.example.com"),
        );

        let directory = TenantDirectory::new(
            store.clone(),
            Arc::new(InMemoryCacheProvider::new()),
            codec,
            DirectoryConfig::default(),
        )
        .unwrap();
        (directory, store)
    }

    #[tokio::test]
    async fn test_resolve_and_decrypt() {
        let (directory, _store) = directory();

        let entry = directory
            .resolve(&TenantLookup::by_reference("acme"))
            .await
            .unwrap();

        assert_eq!(entry.id, "t-1");
        assert_eq!(
            directory.decrypt_connection_uri(&entry).unwrap(),
            "postgres://shop:pw@db/acme"
        );
    }

    #[tokio::test]
    async fn test_cache_serves_after_store_removal() {
        let (directory, store) = directory();

        directory.resolve(&TenantLookup::by_id("t-1")).await.unwrap();
        store.remove("t-1");

        let entry = directory
            .resolve(&TenantLookup::by_host("acme.example.com"))
            .await
            .unwrap();
        assert_eq!(entry.id, "t-1");
    }

    #[tokio::test]
    async fn test_gate_released_after_fetch() {
        let (directory, _store) = directory();
        directory.resolve(&TenantLookup::by_id("t-1")).await.unwrap();
        assert!(directory.inflight.lock().is_empty());
    }
}
