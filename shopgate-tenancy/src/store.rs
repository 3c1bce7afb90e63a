//! Authoritative Tenant Store
//!
//! The slow source of truth behind the directory cache. Applications
//! implement [`AuthoritativeTenantStore`] over their own control-plane
//! database.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::error::Result;
use crate::tenant::{LookupKey, TenantRecord};
use crate::validation::normalize_host;

/// Tenant store trait (implement with your database)
///
/// Return `Ok(None)` for a tenant that does not exist; reserve errors for
/// storage failures.
#[async_trait]
pub trait AuthoritativeTenantStore: Send + Sync {
    /// Find tenant by canonical id
    async fn find_by_id(&self, id: &str) -> Result<Option<TenantRecord>>;

    /// Find tenant by public reference id
    async fn find_by_reference(&self, reference_id: &str) -> Result<Option<TenantRecord>>;

    /// Find tenant by normalised hostname
    async fn find_by_host(&self, host: &str) -> Result<Option<TenantRecord>>;

    /// Find tenant by whichever key was supplied
    async fn find(&self, key: &LookupKey) -> Result<Option<TenantRecord>> {
        match key {
            LookupKey::Id(id) => self.find_by_id(id).await,
            LookupKey::Reference(reference) => self.find_by_reference(reference).await,
            LookupKey::Host(host) => self.find_by_host(host).await,
        }
    }
}

/// In-memory tenant store.
///
/// Backs tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    tenants: RwLock<HashMap<String, TenantRecord>>,
}

impl InMemoryTenantStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tenant
    pub fn upsert(&self, record: TenantRecord) {
        self.tenants.write().insert(record.id.clone(), record);
    }

    /// Remove a tenant
    pub fn remove(&self, id: &str) -> Option<TenantRecord> {
        self.tenants.write().remove(id)
    }

    /// Number of tenants
    pub fn len(&self) -> usize {
        self.tenants.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.tenants.read().is_empty()
    }
}

#[async_trait]
impl AuthoritativeTenantStore for InMemoryTenantStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<TenantRecord>> {
        Ok(self.tenants.read().get(id).cloned())
    }

    async fn find_by_reference(&self, reference_id: &str) -> Result<Option<TenantRecord>> {
        Ok(self
            .tenants
            .read()
            .values()
            .find(|t| t.reference_id == reference_id)
            .cloned())
    }

    async fn find_by_host(&self, host: &str) -> Result<Option<TenantRecord>> {
        let host = normalize_host(host);
        Ok(self
            .tenants
            .read()
            .values()
            .find(|t| t.hostnames.iter().any(|known| normalize_host(known) == host))
            .cloned())
    }
}
