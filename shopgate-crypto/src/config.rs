//! Key ring configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::KeyRing;
use crate::error::CodecResult;

/// Key material loaded from configuration.
///
/// Keys are base64-encoded 32-byte values indexed by the reference that
/// tenant records carry.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRingConfig {
    /// Key reference to base64 key material
    pub keys: BTreeMap<String, String>,
}

impl KeyRingConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a base64-encoded key.
    pub fn with_key(mut self, key_ref: impl Into<String>, encoded: impl Into<String>) -> Self {
        self.keys.insert(key_ref.into(), encoded.into());
        self
    }

    /// Decode every key into a [`KeyRing`].
    pub fn build(&self) -> CodecResult<KeyRing> {
        let ring = KeyRing::from_base64(
            self.keys
                .iter()
                .map(|(key_ref, encoded)| (key_ref.as_str(), encoded.as_str())),
        )?;
        tracing::debug!(keys = ring.len(), "Loaded credential key ring");
        Ok(ring)
    }
}

impl fmt::Debug for KeyRingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRingConfig")
            .field("keys", &self.keys.keys().collect::<Vec<_>>())
            .finish()
    }
}
