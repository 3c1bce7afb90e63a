//! Redis configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use url::Url;

use crate::{RedisError, Result};

/// Prefix of the Redis environment overrides.
pub const REDIS_ENV_PREFIX: &str = "SHOPGATE_REDIS_";

/// Connection settings for the shared pool.
///
/// `Debug` and [`redacted_url`](Self::redacted_url) never show the
/// password, whether it is set separately or embedded in `url`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// `redis://host:port`, or `rediss://` for TLS
    pub url: String,
    /// Maximum pooled connections
    pub pool_size: u32,
    /// Connections kept open while idle
    pub min_idle: Option<u32>,
    /// Time allowed to check a connection out of the pool, in seconds
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// Logical database
    pub database: Option<u8>,
    /// ACL user (Redis 6+)
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            min_idle: Some(1),
            connection_timeout: Duration::from_secs(5),
            database: None,
            username: None,
            password: None,
        }
    }
}

impl RedisConfig {
    /// Defaults pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> RedisConfigBuilder {
        RedisConfigBuilder::default()
    }

    /// Defaults overridden by `SHOPGATE_REDIS_*` variables.
    pub fn from_env() -> RedisConfigBuilder {
        Self::builder().apply_env()
    }

    /// Check the URL scheme and pool sizing.
    pub fn validate(&self) -> Result<()> {
        let url = parse_url(&self.url)?;
        if !matches!(url.scheme(), "redis" | "rediss") {
            return Err(RedisError::Config(format!(
                "redis url must use redis:// or rediss://, got {}://",
                url.scheme()
            )));
        }

        if self.pool_size == 0 {
            return Err(RedisError::Config("pool_size must be at least 1".to_string()));
        }
        if let Some(min_idle) = self.min_idle
            && min_idle > self.pool_size
        {
            return Err(RedisError::Config(format!(
                "min_idle ({min_idle}) exceeds pool_size ({})",
                self.pool_size
            )));
        }
        Ok(())
    }

    /// The URL handed to the client, with credentials and database applied.
    pub fn connection_url(&self) -> Result<String> {
        let mut url = parse_url(&self.url)?;

        if let Some(password) = &self.password {
            let username = self.username.as_deref().unwrap_or("");
            url.set_username(username)
                .and_then(|_| url.set_password(Some(password)))
                .map_err(|_| RedisError::Config("redis url cannot carry credentials".to_string()))?;
        }
        if let Some(db) = self.database {
            url.set_path(&format!("/{db}"));
        }

        Ok(url.to_string())
    }

    /// The configured URL with any password masked.
    pub fn redacted_url(&self) -> String {
        match Url::parse(&self.url) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<invalid url>".to_string(),
        }
    }
}

fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| RedisError::Config(format!("invalid redis url: {e}")))
}

impl fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.redacted_url())
            .field("pool_size", &self.pool_size)
            .field("min_idle", &self.min_idle)
            .field("connection_timeout", &self.connection_timeout)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Builder for [`RedisConfig`].
#[derive(Default)]
pub struct RedisConfigBuilder {
    config: RedisConfig,
}

impl RedisConfigBuilder {
    /// Start from an existing configuration.
    pub fn from_config(config: RedisConfig) -> Self {
        Self { config }
    }

    /// Apply `SHOPGATE_REDIS_*` overrides from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs.
    ///
    /// Recognises `URL`, `POOL_SIZE`, `DATABASE`, `USERNAME` and `PASSWORD`
    /// after [`REDIS_ENV_PREFIX`]. Unparseable numbers are ignored.
    pub fn apply_env_from<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            let Some(setting) = name.strip_prefix(REDIS_ENV_PREFIX) else {
                continue;
            };
            match setting {
                "URL" => self.config.url = value,
                "POOL_SIZE" => {
                    if let Ok(size) = value.parse() {
                        self.config.pool_size = size;
                    }
                }
                "DATABASE" => {
                    if let Ok(db) = value.parse() {
                        self.config.database = Some(db);
                    }
                }
                "USERNAME" => self.config.username = Some(value),
                "PASSWORD" => self.config.password = Some(value),
                _ => {}
            }
        }
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.url = url.into();
        self
    }

    pub fn pool_size(mut self, size: u32) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.config.min_idle = Some(min_idle);
        self
    }

    /// Pool checkout timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn database(mut self, db: u8) -> Self {
        self.config.database = Some(db);
        self
    }

    /// ACL credentials. Pass an empty username for password-only auth.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        let username = username.into();
        self.config.username = (!username.is_empty()).then_some(username);
        self.config.password = Some(password.into());
        self
    }

    pub fn build(self) -> RedisConfig {
        self.config
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
