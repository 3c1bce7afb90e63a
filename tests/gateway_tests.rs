//! Integration tests for the tenant gateway.
//!
//! Everything runs against the in-memory directory cache and session store.

use shopgate::prelude::*;
use shopgate::shopgate_crypto::{CredentialCodec, KeyRing};
use shopgate::shopgate_tenancy::{
    InMemoryTenantStore, SessionPolicy, TenantError, TenantEvent, TenantEventHandler,
    TenantPayload, TenantRecord,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const KEY_REF: &str = "primary";
const ACME_URI: &str = "postgres://acme:pw@db-1:5432/acme";
const GLOBEX_URI: &str = "postgres://globex:pw@db-2:5432/globex";

#[derive(Debug)]
struct MockConn {
    uri: String,
}

#[derive(Default)]
struct MockProvider {
    connects: AtomicUsize,
    closes: AtomicUsize,
}

#[async_trait]
impl DatabaseProvider for MockProvider {
    type Connection = MockConn;

    async fn connect(&self, _key: &str, uri: &str) -> shopgate::shopgate_tenancy::Result<MockConn> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            uri: uri.to_string(),
        })
    }

    async fn close(&self, _key: &str, _conn: &MockConn) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    gateway: TenantGateway<MockProvider>,
    provider: Arc<MockProvider>,
    store: Arc<InMemoryTenantStore>,
    codec: CredentialCodec,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(customize: impl FnOnce(&mut GatewayConfig)) -> Self {
        let mut config = GatewayConfig::default();
        config.keys = config.keys.with_key(KEY_REF, KeyRing::generate_key());
        customize(&mut config);

        let codec = CredentialCodec::new(config.keys.build().unwrap());
        let provider = Arc::new(MockProvider::default());
        let store = Arc::new(InMemoryTenantStore::new());
        let gateway = TenantGateway::in_memory(
            Arc::clone(&provider),
            Arc::clone(&store) as Arc<dyn AuthoritativeTenantStore>,
            &config,
        )
        .unwrap();

        Self {
            gateway,
            provider,
            store,
            codec,
        }
    }

    fn payload(&self, uri: &str) -> TenantPayload {
        TenantPayload::new(self.codec.encrypt_to_string(uri, KEY_REF).unwrap(), KEY_REF)
    }

    fn add_tenant(&self, id: &str, reference: &str, host: &str, payload: TenantPayload) {
        self.store
            .upsert(TenantRecord::new(id, reference, payload).with_hostname(host));
    }

    fn add_acme(&self) {
        let payload = self.payload(ACME_URI).with_secret(
            "stripe",
            self.codec.encrypt_to_string("sk_live_acme", KEY_REF).unwrap(),
        );
        self.add_tenant("t-acme", "acme", "shop.acme.com", payload);
    }

    fn connects(&self) -> usize {
        self.provider.connects.load(Ordering::SeqCst)
    }

    fn closes(&self) -> usize {
        self.provider.closes.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Tenant Resolution
// =============================================================================

#[tokio::test]
async fn test_resolve_tenant_decrypts_and_connects() {
    let h = Harness::new();
    h.add_acme();

    let resolved = h
        .gateway
        .resolve_tenant(&TenantLookup::by_host("shop.acme.com"))
        .await
        .unwrap();

    assert_eq!(resolved.tenant.id, "t-acme");
    assert_eq!(resolved.connection.uri, ACME_URI);
    assert_eq!(resolved.connection.key(), "t-acme");
    assert_eq!(resolved.credentials.get("stripe"), Some("sk_live_acme"));
    assert_eq!(h.connects(), 1);
}

#[tokio::test]
async fn test_every_alias_shares_one_connection() {
    let h = Harness::new();
    h.add_acme();

    let by_host = h
        .gateway
        .resolve_tenant(&TenantLookup::by_host("SHOP.ACME.COM:443"))
        .await
        .unwrap();
    let by_reference = h
        .gateway
        .resolve_tenant(&TenantLookup::by_reference("acme"))
        .await
        .unwrap();
    let by_id = h
        .gateway
        .resolve_tenant(&TenantLookup::by_id("t-acme"))
        .await
        .unwrap();

    assert!(ConnectionHandle::ptr_eq(&by_host.connection, &by_reference.connection));
    assert!(ConnectionHandle::ptr_eq(&by_host.connection, &by_id.connection));
    assert_eq!(h.connects(), 1);
}

#[tokio::test]
async fn test_tenants_get_separate_connections() {
    let h = Harness::new();
    h.add_acme();
    h.add_tenant("t-globex", "globex", "globex.example", h.payload(GLOBEX_URI));

    let acme = h
        .gateway
        .resolve_tenant(&TenantLookup::by_id("t-acme"))
        .await
        .unwrap();
    let globex = h
        .gateway
        .resolve_tenant(&TenantLookup::by_id("t-globex"))
        .await
        .unwrap();

    assert!(!ConnectionHandle::ptr_eq(&acme.connection, &globex.connection));
    assert_eq!(globex.connection.uri, GLOBEX_URI);
    assert!(globex.credentials.is_empty());
    assert_eq!(h.connects(), 2);
}

#[tokio::test]
async fn test_resolution_errors() {
    let h = Harness::new();
    h.add_acme();
    h.add_tenant("t-globex", "globex", "globex.example", h.payload(GLOBEX_URI));
    h.store.upsert(
        TenantRecord::new("t-gone", "gone", h.payload(GLOBEX_URI)).with_active(false),
    );

    let missing = h
        .gateway
        .resolve_tenant(&TenantLookup::by_host("unknown.example"))
        .await;
    assert!(matches!(
        missing,
        Err(GatewayError::Tenant(TenantError::NotFound(_)))
    ));

    let inactive = h.gateway.resolve_tenant(&TenantLookup::by_id("t-gone")).await;
    assert!(matches!(
        inactive,
        Err(GatewayError::Tenant(TenantError::Inactive(_)))
    ));

    let conflicting = h
        .gateway
        .resolve_tenant(&TenantLookup::by_id("t-acme").with_host("globex.example"))
        .await;
    assert!(matches!(
        conflicting,
        Err(GatewayError::Tenant(TenantError::InvalidLookup(_)))
    ));

    assert_eq!(h.connects(), 0);
}

#[tokio::test]
async fn test_undecryptable_credentials_never_connect() {
    let h = Harness::new();
    let foreign = CredentialCodec::new(KeyRing::new().with_key(KEY_REF, [7u8; 32]));
    let payload = TenantPayload::new(
        foreign.encrypt_to_string(ACME_URI, KEY_REF).unwrap(),
        KEY_REF,
    );
    h.add_tenant("t-acme", "acme", "shop.acme.com", payload);

    let result = h.gateway.resolve_tenant(&TenantLookup::by_id("t-acme")).await;

    let err = result.unwrap_err();
    assert!(matches!(err, GatewayError::Tenant(TenantError::Config(_))));
    assert!(!err.is_retryable());
    assert!(!err.to_string().contains("acme:pw"));
    assert_eq!(h.connects(), 0);
}

// =============================================================================
// Sessions
// =============================================================================

async fn acme_tenant(h: &Harness) -> Arc<TenantCacheEntry> {
    h.gateway
        .directory()
        .resolve(&TenantLookup::by_id("t-acme"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_login_and_authenticate() {
    let h = Harness::new();
    h.add_acme();
    let tenant = acme_tenant(&h).await;

    let issued = h.gateway.login(&tenant, "user-1").await.unwrap();
    assert!(issued.evicted.is_empty());

    let session = h
        .gateway
        .authenticate("t-acme", &issued.session_id, &issued.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.user_id, "user-1");
    assert_eq!(session.tenant_id, "t-acme");

    let wrong = h
        .gateway
        .authenticate("t-acme", &issued.session_id, "not-the-token")
        .await
        .unwrap();
    assert!(wrong.is_none());

    let other_tenant = h
        .gateway
        .authenticate("t-globex", &issued.session_id, &issued.token)
        .await
        .unwrap();
    assert!(other_tenant.is_none());
}

#[tokio::test]
async fn test_login_enforces_tenant_session_limit() {
    let h = Harness::new();
    let policy = SessionPolicy {
        session_limit: 2,
        ..SessionPolicy::default()
    };
    h.add_tenant(
        "t-acme",
        "acme",
        "shop.acme.com",
        h.payload(ACME_URI).with_session_policy(policy),
    );
    let tenant = acme_tenant(&h).await;

    let first = h.gateway.login(&tenant, "user-1").await.unwrap();
    let second = h.gateway.login(&tenant, "user-1").await.unwrap();
    let third = h.gateway.login(&tenant, "user-1").await.unwrap();

    assert_eq!(third.evicted, vec![first.session_id.clone()]);
    assert!(
        h.gateway
            .authenticate("t-acme", &first.session_id, &first.token)
            .await
            .unwrap()
            .is_none()
    );

    let live: HashSet<String> = h
        .gateway
        .sessions()
        .sessions_for_user("t-acme", "user-1")
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.session_id)
        .collect();
    assert_eq!(
        live,
        HashSet::from([second.session_id, third.session_id])
    );
}

#[tokio::test]
async fn test_zero_policy_limit_uses_configured_default() {
    let h = Harness::with_config(|config| config.session.default_limit = 1);
    let policy = SessionPolicy {
        session_limit: 0,
        ..SessionPolicy::default()
    };
    h.add_tenant(
        "t-acme",
        "acme",
        "shop.acme.com",
        h.payload(ACME_URI).with_session_policy(policy),
    );
    let tenant = acme_tenant(&h).await;

    let first = h.gateway.login(&tenant, "user-1").await.unwrap();
    let second = h.gateway.login(&tenant, "user-1").await.unwrap();

    assert_eq!(second.evicted, vec![first.session_id]);
}

#[tokio::test]
async fn test_refresh_rotates_token() {
    let h = Harness::new();
    h.add_acme();
    let tenant = acme_tenant(&h).await;
    let issued = h.gateway.login(&tenant, "user-1").await.unwrap();

    let refreshed = h
        .gateway
        .refresh("t-acme", &issued.session_id, &issued.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.session_id, issued.session_id);
    assert_ne!(refreshed.token, issued.token);

    let old = h
        .gateway
        .authenticate("t-acme", &issued.session_id, &issued.token)
        .await
        .unwrap();
    assert!(old.is_none());

    let new = h
        .gateway
        .authenticate("t-acme", &refreshed.session_id, &refreshed.token)
        .await
        .unwrap();
    assert!(new.is_some());

    // The old token cannot be replayed for another rotation.
    let replay = h
        .gateway
        .refresh("t-acme", &issued.session_id, &issued.token)
        .await
        .unwrap();
    assert!(replay.is_none());
}

#[tokio::test]
async fn test_logout_and_logout_everywhere() {
    let h = Harness::new();
    h.add_acme();
    let tenant = acme_tenant(&h).await;

    let phone = h.gateway.login(&tenant, "user-1").await.unwrap();
    let laptop = h.gateway.login(&tenant, "user-1").await.unwrap();
    let tablet = h.gateway.login(&tenant, "user-1").await.unwrap();
    let other = h.gateway.login(&tenant, "user-2").await.unwrap();

    assert!(h.gateway.logout("t-acme", &phone.session_id).await.unwrap());
    assert!(!h.gateway.logout("t-acme", &phone.session_id).await.unwrap());

    assert_eq!(h.gateway.logout_everywhere("t-acme", "user-1").await.unwrap(), 2);
    for issued in [&laptop, &tablet] {
        let session = h
            .gateway
            .authenticate("t-acme", &issued.session_id, &issued.token)
            .await
            .unwrap();
        assert!(session.is_none());
    }

    let untouched = h
        .gateway
        .authenticate("t-acme", &other.session_id, &other.token)
        .await
        .unwrap();
    assert!(untouched.is_some());
}

// =============================================================================
// Invalidation and Shutdown
// =============================================================================

#[tokio::test]
async fn test_tenant_event_reconnects_with_new_credentials() {
    let h = Harness::new();
    h.add_acme();

    let before = h
        .gateway
        .resolve_tenant(&TenantLookup::by_host("shop.acme.com"))
        .await
        .unwrap();
    assert_eq!(before.connection.uri, ACME_URI);

    let moved = "postgres://acme:pw@db-9:5432/acme";
    h.add_tenant("t-acme", "acme", "shop.acme.com", h.payload(moved));
    h.gateway
        .handle(&TenantEvent::Updated {
            tenant_id: "t-acme".to_string(),
        })
        .await;
    assert_eq!(h.closes(), 1);

    let after = h
        .gateway
        .resolve_tenant(&TenantLookup::by_host("shop.acme.com"))
        .await
        .unwrap();
    assert_eq!(after.connection.uri, moved);
    assert!(!ConnectionHandle::ptr_eq(&before.connection, &after.connection));
    assert_eq!(h.connects(), 2);
}

#[tokio::test]
async fn test_shutdown_closes_connections_and_refuses_work() {
    let h = Harness::new();
    h.add_acme();
    h.add_tenant("t-globex", "globex", "globex.example", h.payload(GLOBEX_URI));

    let gateway = Arc::new(h.gateway);
    gateway.start().await.unwrap();

    for id in ["t-acme", "t-globex"] {
        gateway.resolve_tenant(&TenantLookup::by_id(id)).await.unwrap();
    }

    assert_eq!(gateway.shutdown().await, 2);
    assert_eq!(h.provider.closes.load(Ordering::SeqCst), 2);

    let after = gateway.resolve_tenant(&TenantLookup::by_id("t-acme")).await;
    assert!(matches!(
        after,
        Err(GatewayError::Tenant(TenantError::RegistryClosed))
    ));

    // A second shutdown has nothing left to close.
    assert_eq!(gateway.shutdown().await, 0);
}

#[tokio::test]
async fn test_debug_output_hides_secrets() {
    let h = Harness::new();
    h.add_acme();
    let tenant = acme_tenant(&h).await;

    let resolved = h
        .gateway
        .resolve_tenant(&TenantLookup::by_id("t-acme"))
        .await
        .unwrap();
    let issued = h.gateway.login(&tenant, "user-1").await.unwrap();
    let session = h
        .gateway
        .authenticate("t-acme", &issued.session_id, &issued.token)
        .await
        .unwrap()
        .unwrap();

    let rendered = format!("{resolved:?} {issued:?} {session:?} {:?}", h.gateway);
    assert!(!rendered.contains("sk_live_acme"));
    assert!(!rendered.contains("acme:pw"));
    assert!(!rendered.contains(&issued.token));
    assert!(!rendered.contains(&session.token_hash));
    assert!(rendered.contains("stripe"));
}
