//! Gateway configuration.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. built-in defaults
//! 2. a TOML file
//! 3. `SHOPGATE_*` environment variables (a `.env` file is loaded first
//!    when present)

use serde::{Deserialize, Serialize};
use shopgate_crypto::KeyRingConfig;
use shopgate_redis::{RedisConfig, RedisConfigBuilder};
use shopgate_session::SessionConfig;
use shopgate_tenancy::{DirectoryConfig, RegistryConfig};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::logging::{LogConfig, LogFormat};

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "SHOPGATE_";

/// Prefix of key ring entries: `SHOPGATE_KEY_PRIMARY=<base64>` adds key
/// reference `primary`.
pub const KEY_ENV_PREFIX: &str = "SHOPGATE_KEY_";

/// Complete gateway configuration.
///
/// ```toml
/// [redis]
/// url = "redis://cache.internal:6379"
/// pool_size = 32
///
/// [registry]
/// max_entries = 256
/// idle_ttl = 900000
///
/// [session]
/// default_limit = 3
///
/// [keys.keys]
/// primary = "base64-encoded-32-byte-key"
///
/// [log]
/// level = "info"
/// format = "json"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Redis pool backing the directory cache, sessions and events
    pub redis: RedisConfig,
    /// Connection registry limits and timeouts
    pub registry: RegistryConfig,
    /// Tenant directory cache
    pub directory: DirectoryConfig,
    /// Session store
    pub session: SessionConfig,
    /// Credential encryption keys
    pub keys: KeyRingConfig,
    /// Logging
    pub log: LogConfig,
}

impl GatewayConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("TOML parse error: {e}")))
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load defaults, an optional file and the environment, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        // A missing .env file is not an error.
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(GatewayError::Config(format!("failed to load .env: {e}")));
        }

        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(mut self) -> Self {
        self.redis = RedisConfigBuilder::from_config(self.redis)
            .apply_env()
            .build();
        self.apply_env_from(std::env::vars())
    }

    /// Apply overrides from `(name, value)` pairs.
    ///
    /// Unparseable numbers are ignored. Recognised names:
    ///
    /// - `SHOPGATE_LOG_LEVEL`, `SHOPGATE_LOG_FORMAT`
    /// - `SHOPGATE_NAMESPACE` (directory and session keys)
    /// - `SHOPGATE_REGISTRY_MAX_ENTRIES`, `SHOPGATE_REGISTRY_IDLE_TTL_SECS`
    /// - `SHOPGATE_DIRECTORY_TTL_SECS`
    /// - `SHOPGATE_SESSION_DEFAULT_LIMIT`, `SHOPGATE_SESSION_TTL_SECS`
    /// - `SHOPGATE_KEY_<REF>`
    pub fn apply_env_from<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            if let Some(key_ref) = name.strip_prefix(KEY_ENV_PREFIX) {
                if !key_ref.is_empty() {
                    self.keys = self.keys.with_key(key_ref.to_lowercase(), value);
                }
                continue;
            }

            let Some(setting) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match setting {
                "LOG_LEVEL" => self.log.level = value,
                "LOG_FORMAT" => {
                    if let Some(format) = LogFormat::parse(&value) {
                        self.log.format = format;
                    }
                }
                "NAMESPACE" => {
                    self.directory.namespace = value.clone();
                    self.session.namespace = value;
                }
                "REGISTRY_MAX_ENTRIES" => {
                    if let Ok(max) = value.parse() {
                        self.registry.max_entries = max;
                    }
                }
                "REGISTRY_IDLE_TTL_SECS" => {
                    if let Ok(secs) = value.parse() {
                        self.registry.idle_ttl = Duration::from_secs(secs);
                    }
                }
                "DIRECTORY_TTL_SECS" => {
                    if let Ok(secs) = value.parse() {
                        self.directory.entry_ttl = Duration::from_secs(secs);
                    }
                }
                "SESSION_DEFAULT_LIMIT" => {
                    if let Ok(limit) = value.parse() {
                        self.session.default_limit = limit;
                    }
                }
                "SESSION_TTL_SECS" => {
                    if let Ok(secs) = value.parse() {
                        self.session.default_ttl = Duration::from_secs(secs);
                    }
                }
                _ => {}
            }
        }
        self
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        self.redis
            .validate()
            .map_err(|e| GatewayError::Config(format!("redis: {e}")))?;
        self.registry
            .validate()
            .map_err(|e| GatewayError::Config(format!("registry: {e}")))?;
        self.directory
            .validate()
            .map_err(|e| GatewayError::Config(format!("directory: {e}")))?;
        self.session
            .validate()
            .map_err(|e| GatewayError::Config(format!("session: {e}")))?;

        if self.keys.keys.is_empty() {
            return Err(GatewayError::Config(
                "at least one credential key is required".to_string(),
            ));
        }
        if self.registry.wait_timeout < self.registry.connect_timeout {
            return Err(GatewayError::Config(
                "registry.wait_timeout must not be shorter than registry.connect_timeout"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopgate_crypto::KeyRing;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_need_a_key() {
        let config = GatewayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(GatewayError::Config(msg)) if msg.contains("key")
        ));

        let key = KeyRing::generate_key();
        let config = config.apply_env_from(vars(&[("SHOPGATE_KEY_PRIMARY", key.as_str())]));
        assert!(config.validate().is_ok());
        assert!(config.keys.keys.contains_key("primary"));
    }

    #[test]
    fn test_toml_sections() {
        let config = GatewayConfig::from_toml_str(
            r#"
            [redis]
            url = "redis://cache.internal:6379"
            pool_size = 4

            [registry]
            max_entries = 8
            negative_ttl = 2500

            [session]
            default_limit = 2
            default_ttl = 600

            [log]
            format = "pretty"
            "#,
        )
        .unwrap();

        assert_eq!(config.redis.pool_size, 4);
        assert_eq!(config.registry.max_entries, 8);
        assert_eq!(config.registry.negative_ttl, Duration::from_millis(2500));
        assert_eq!(config.session.default_limit, 2);
        assert_eq!(config.session.default_ttl, Duration::from_secs(600));
        assert_eq!(config.log.format, LogFormat::Pretty);
        assert_eq!(config.directory.namespace, "shopgate");
    }

    #[test]
    fn test_env_overrides() {
        let config = GatewayConfig::default().apply_env_from(vars(&[
            ("SHOPGATE_LOG_LEVEL", "debug"),
            ("SHOPGATE_LOG_FORMAT", "compact"),
            ("SHOPGATE_NAMESPACE", "shop-eu"),
            ("SHOPGATE_REGISTRY_MAX_ENTRIES", "64"),
            ("SHOPGATE_SESSION_DEFAULT_LIMIT", "not-a-number"),
            ("OTHER_APP_LOG_LEVEL", "trace"),
        ]));

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log.format, LogFormat::Compact);
        assert_eq!(config.directory.namespace, "shop-eu");
        assert_eq!(config.session.namespace, "shop-eu");
        assert_eq!(config.registry.max_entries, 64);
        assert_eq!(config.session.default_limit, 5);
    }

    #[test]
    fn test_validate_rejects_bad_sections() {
        let key = KeyRing::generate_key();
        let base =
            GatewayConfig::default().apply_env_from(vars(&[("SHOPGATE_KEY_PRIMARY", key.as_str())]));

        let mut config = base.clone();
        config.registry.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.registry.wait_timeout = Duration::from_secs(1);
        assert!(config.validate().is_err());

        let mut config = base;
        config.redis.url = "http://cache:6379".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = GatewayConfig::from_file("/nonexistent/shopgate.toml");
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
