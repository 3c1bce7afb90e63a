//! Input validation for tenant keys, connection URIs and hostnames.
//!
//! Everything here runs before any network call; malformed input is
//! rejected with [`TenantError::InvalidKey`].

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::error::{Result, TenantError};

/// Maximum tenant key length.
pub const MAX_TENANT_KEY_LEN: usize = 64;

static TENANT_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("tenant key pattern is valid"));

/// Check a tenant key: ASCII alphanumerics, `-` and `_`, 1 to 64 characters.
pub fn validate_tenant_key(key: &str) -> Result<()> {
    if TENANT_KEY.is_match(key) {
        Ok(())
    } else {
        Err(TenantError::InvalidKey(format!(
            "tenant key must match [A-Za-z0-9_-]{{1,{MAX_TENANT_KEY_LEN}}}, got {} characters",
            key.chars().count()
        )))
    }
}

/// Check that `uri` parses and uses one of `allowed_schemes`.
///
/// Error messages never echo the URI, which usually carries a password.
pub fn validate_connection_uri(uri: &str, allowed_schemes: &[String]) -> Result<()> {
    let parsed = Url::parse(uri)
        .map_err(|e| TenantError::InvalidKey(format!("connection URI is malformed: {e}")))?;

    let scheme = parsed.scheme();
    if !allowed_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
        return Err(TenantError::InvalidKey(format!(
            "connection URI scheme '{scheme}' is not allowed"
        )));
    }

    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(TenantError::InvalidKey(
            "connection URI has no host".to_string(),
        ));
    }

    Ok(())
}

/// Replace the password component of a URI so it can be logged.
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable uri>".to_string(),
    }
}

/// Normalise a `Host` header value: trim, lowercase, drop the port and any
/// trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();

    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    without_port.trim_end_matches('.').to_ascii_lowercase()
}
