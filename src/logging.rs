//! Logging bootstrap.
//!
//! Everything in shopgate logs through `tracing`. This module installs the
//! global subscriber once at process start.
//!
//! # Environment Variables
//!
//! - `SHOPGATE_LOG_LEVEL=trace|debug|info|warn|error` - Set log level
//! - `SHOPGATE_LOG_FORMAT=pretty|compact|json` - Set output format
//! - `RUST_LOG` - Full filter directives; wins over the configured level

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{GatewayError, Result};

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable output
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    #[default]
    Json,
}

impl LogFormat {
    /// Parse a format name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(LogFormat::Pretty),
            "compact" => Some(LogFormat::Compact),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive, e.g. `info` or `shopgate_tenancy=debug,info`
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Colored output (pretty and compact formats)
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
            ansi: false,
        }
    }
}

impl LogConfig {
    /// Set the log level.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Set the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Build the filter: `RUST_LOG` if set, the configured level otherwise.
    pub fn filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| GatewayError::Logging(format!("invalid log level: {e}"))),
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match config.format {
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
        LogFormat::Compact => builder.compact().with_ansi(config.ansi).try_init(),
        LogFormat::Pretty => builder.pretty().with_ansi(config.ansi).try_init(),
    };
    installed.map_err(|e| GatewayError::Logging(e.to_string()))
}
