//! Registry and directory configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TenantError};

/// Connection URI schemes accepted by default.
pub const DEFAULT_SCHEMES: &[&str] = &[
    "postgres",
    "postgresql",
    "mysql",
    "mongodb",
    "mongodb+srv",
    "redis",
    "rediss",
];

/// Connection registry configuration.
///
/// # Examples
///
/// ```
/// use shopgate_tenancy::RegistryConfig;
/// use std::time::Duration;
///
/// let config = RegistryConfig::default()
///     .with_max_entries(256)
///     .with_idle_ttl(Duration::from_secs(600));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Maximum live entries before LRU eviction
    pub max_entries: usize,

    /// Ready entries unused for this long are swept
    #[serde(with = "duration_ms")]
    pub idle_ttl: Duration,

    /// How long a failed connect is remembered before retrying
    #[serde(with = "duration_ms")]
    pub negative_ttl: Duration,

    /// Upper bound on a single connect call
    #[serde(with = "duration_ms")]
    pub connect_timeout: Duration,

    /// Upper bound on waiting for another caller's in-flight connect
    #[serde(with = "duration_ms")]
    pub wait_timeout: Duration,

    /// Background sweep period
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,

    /// Upper bound on closing everything at shutdown
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Accepted connection URI schemes
    pub allowed_schemes: Vec<String>,

    /// Backoff for `acquire_with_retry`
    pub retry: RetryPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 128,
            idle_ttl: Duration::from_secs(15 * 60),
            negative_ttl: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            wait_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),
            allowed_schemes: DEFAULT_SCHEMES.iter().map(|s| s.to_string()).collect(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RegistryConfig {
    /// Set maximum entries
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set idle TTL
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Set negative-cache TTL
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Set connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set in-flight wait timeout
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Set sweep interval
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Replace the accepted URI schemes
    pub fn with_allowed_schemes<I, S>(mut self, schemes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_schemes = schemes.into_iter().map(Into::into).collect();
        self
    }

    /// Set retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(TenantError::Config(
                "registry max_entries must be greater than zero".to_string(),
            ));
        }
        if self.allowed_schemes.is_empty() {
            return Err(TenantError::Config(
                "registry needs at least one allowed scheme".to_string(),
            ));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("wait_timeout", self.wait_timeout),
            ("sweep_interval", self.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(TenantError::Config(format!(
                    "registry {name} must be greater than zero"
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(TenantError::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff for retryable acquire failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    #[serde(with = "duration_ms")]
    pub initial_backoff: Duration,

    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Tenant directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Key prefix for cached entries and aliases
    pub namespace: String,

    /// Lifetime of cached entries and alias pointers
    #[serde(with = "duration_ms")]
    pub entry_ttl: Duration,

    /// Channel carrying tenant update events
    pub events_channel: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            namespace: "shopgate".to_string(),
            entry_ttl: Duration::from_secs(5 * 60),
            events_channel: "shopgate:tenant-events".to_string(),
        }
    }
}

impl DirectoryConfig {
    /// Set namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set entry TTL
    pub fn with_entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Set the tenant events channel
    pub fn with_events_channel(mut self, channel: impl Into<String>) -> Self {
        self.events_channel = channel.into();
        self
    }

    /// Check invariants.
    pub fn validate(&self) -> Result<()> {
        if self.entry_ttl.is_zero() {
            return Err(TenantError::Config(
                "directory entry_ttl must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
