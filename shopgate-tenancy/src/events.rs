//! Tenant update events.
//!
//! The control plane publishes a [`TenantEvent`] whenever a tenant changes;
//! every gateway process listens and drops its cached state for that
//! tenant, so updates show up before the cache TTL runs out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::directory::TenantDirectory;

/// Change notification for a single tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TenantEvent {
    /// Credentials, aliases or policy changed
    Updated { tenant_id: String },
    /// Tenant removed or deactivated
    Deleted { tenant_id: String },
}

impl TenantEvent {
    /// The affected tenant.
    pub fn tenant_id(&self) -> &str {
        match self {
            TenantEvent::Updated { tenant_id } | TenantEvent::Deleted { tenant_id } => tenant_id,
        }
    }
}

/// Something that reacts to tenant events.
#[async_trait]
pub trait TenantEventHandler: Send + Sync + 'static {
    async fn handle(&self, event: &TenantEvent);
}

#[async_trait]
impl TenantEventHandler for TenantDirectory {
    async fn handle(&self, event: &TenantEvent) {
        if let Err(e) = self.invalidate(event.tenant_id()).await {
            tracing::warn!(
                tenant = %event.tenant_id(),
                error = %e,
                "Failed to invalidate tenant after event"
            );
        }
    }
}

#[cfg(feature = "redis")]
pub use self::redis_events::{TenantEventPublisher, spawn_tenant_event_listener};

#[cfg(feature = "redis")]
mod redis_events {
    use futures::StreamExt;
    use shopgate_redis::{RedisService, redis};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tracing::{debug, error, info, warn};

    use super::{TenantEvent, TenantEventHandler};
    use crate::error::{Result, TenantError};

    const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

    /// Publishes tenant events over Redis pub/sub.
    #[derive(Clone)]
    pub struct TenantEventPublisher {
        redis: Arc<RedisService>,
        channel: String,
    }

    impl TenantEventPublisher {
        /// Create a publisher for `channel`
        pub fn new(redis: Arc<RedisService>, channel: impl Into<String>) -> Self {
            Self {
                redis,
                channel: channel.into(),
            }
        }

        /// Publish an event, returning how many listeners received it.
        pub async fn publish(&self, event: &TenantEvent) -> Result<u32> {
            let payload =
                serde_json::to_string(event).map_err(|e| TenantError::Cache(e.to_string()))?;

            let mut conn = self
                .redis
                .get()
                .await
                .map_err(|e| TenantError::Cache(e.to_string()))?;

            let receivers: u32 = redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(payload)
                .query_async(&mut *conn)
                .await
                .map_err(|e| TenantError::Cache(e.to_string()))?;

            debug!(
                channel = %self.channel,
                tenant = %event.tenant_id(),
                receivers,
                "Published tenant event"
            );
            Ok(receivers)
        }
    }

    /// Subscribe to `channel` and feed every event to `handler`.
    ///
    /// The subscription is re-established if the connection drops. Abort
    /// the returned handle to stop listening.
    pub async fn spawn_tenant_event_listener(
        redis: &RedisService,
        channel: impl Into<String>,
        handler: Arc<dyn TenantEventHandler>,
    ) -> Result<JoinHandle<()>> {
        let channel = channel.into();
        let client = redis
            .client()
            .map_err(|e| TenantError::Cache(e.to_string()))?;

        // Fail fast on the first subscription; later drops are retried.
        let pubsub = subscribe(&client, &channel).await?;
        info!(channel = %channel, "Listening for tenant events");

        Ok(tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            loop {
                let mut current = match pubsub.take() {
                    Some(current) => current,
                    None => match subscribe(&client, &channel).await {
                        Ok(current) => current,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Tenant event resubscribe failed");
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            continue;
                        }
                    },
                };

                let mut messages = current.on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "Failed to read tenant event payload");
                            continue;
                        }
                    };

                    match serde_json::from_str::<TenantEvent>(&payload) {
                        Ok(event) => {
                            debug!(tenant = %event.tenant_id(), "Received tenant event");
                            handler.handle(&event).await;
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed tenant event"),
                    }
                }

                warn!(channel = %channel, "Tenant event subscription dropped");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        }))
    }

    async fn subscribe(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| TenantError::Cache(e.to_string()))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| TenantError::Cache(e.to_string()))?;
        Ok(pubsub)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let event = TenantEvent::Updated {
            tenant_id: "t-1".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"updated","tenant_id":"t-1"}"#);

        let parsed: TenantEvent =
            serde_json::from_str(r#"{"type":"deleted","tenant_id":"t-2"}"#).unwrap();
        assert_eq!(parsed.tenant_id(), "t-2");
        assert!(matches!(parsed, TenantEvent::Deleted { .. }));
    }
}
