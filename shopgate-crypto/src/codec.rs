//! Tenant credential encryption.
//!
//! AES-256-GCM envelopes sealed under a key chosen per call by reference.
//! The key reference is bound into the ciphertext as associated data, so an
//! envelope only opens under the reference it was sealed with.
//!
//! Envelope layout: `version (1) || nonce (12) || ciphertext || tag (16)`.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::collections::HashMap;
use std::fmt;

use crate::error::{CodecError, CodecResult};

/// Length of an AES-256 key in bytes.
pub const KEY_LENGTH: usize = 32;

const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;
const ENVELOPE_VERSION: u8 = 1;

/// Named set of encryption keys.
///
/// Tenants reference a key by name so keys can be rotated without
/// re-encrypting every tenant at once.
#[derive(Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, Aes256Gcm>,
}

impl KeyRing {
    /// Create an empty key ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add raw key material under `key_ref`.
    pub fn with_key(mut self, key_ref: impl Into<String>, key: [u8; KEY_LENGTH]) -> Self {
        self.keys.insert(
            key_ref.into(),
            Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        );
        self
    }

    /// Add a base64-encoded 32-byte key under `key_ref`.
    pub fn insert_base64(&mut self, key_ref: &str, encoded: &str) -> CodecResult<()> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CodecError::InvalidKey {
                key_ref: key_ref.to_string(),
                reason: format!("invalid base64: {e}"),
            })?;

        let cipher = Aes256Gcm::new_from_slice(&bytes).map_err(|_| CodecError::InvalidKey {
            key_ref: key_ref.to_string(),
            reason: format!("key must be {KEY_LENGTH} bytes, got {}", bytes.len()),
        })?;

        self.keys.insert(key_ref.to_string(), cipher);
        Ok(())
    }

    /// Build a key ring from `(key_ref, base64 key)` pairs.
    pub fn from_base64<'a, I>(entries: I) -> CodecResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut ring = Self::new();
        for (key_ref, encoded) in entries {
            ring.insert_base64(key_ref, encoded)?;
        }
        Ok(ring)
    }

    /// Generate fresh key material, base64-encoded.
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(OsRng))
    }

    /// Whether a key is registered under `key_ref`.
    pub fn contains(&self, key_ref: &str) -> bool {
        self.keys.contains_key(key_ref)
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the ring holds no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn cipher(&self, key_ref: &str) -> CodecResult<&Aes256Gcm> {
        self.keys
            .get(key_ref)
            .ok_or_else(|| CodecError::UnknownKey(key_ref.to_string()))
    }
}

impl fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut refs: Vec<&String> = self.keys.keys().collect();
        refs.sort();
        f.debug_struct("KeyRing").field("key_refs", &refs).finish()
    }
}

/// Encrypts and decrypts tenant connection strings and secrets at rest.
#[derive(Debug, Clone)]
pub struct CredentialCodec {
    keys: KeyRing,
}

impl CredentialCodec {
    /// Create a codec over the given key ring.
    pub fn new(keys: KeyRing) -> Self {
        Self { keys }
    }

    /// The key ring backing this codec.
    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Seal `data` under the key named `key_ref`.
    pub fn encrypt(&self, data: &[u8], key_ref: &str) -> CodecResult<Vec<u8>> {
        let cipher = self.keys.cipher(key_ref)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: data,
                    aad: key_ref.as_bytes(),
                },
            )
            .map_err(|e| CodecError::Encrypt(e.to_string()))?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LENGTH + ciphertext.len());
        envelope.push(ENVELOPE_VERSION);
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open an envelope produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, data: &[u8], key_ref: &str) -> CodecResult<Vec<u8>> {
        let cipher = self.keys.cipher(key_ref)?;

        if data.len() < 1 + NONCE_LENGTH + TAG_LENGTH {
            return Err(CodecError::Decrypt("envelope too short".to_string()));
        }

        let (version, rest) = data.split_at(1);
        if version[0] != ENVELOPE_VERSION {
            return Err(CodecError::Decrypt(format!(
                "unsupported envelope version {}",
                version[0]
            )));
        }

        let (nonce, ciphertext) = rest.split_at(NONCE_LENGTH);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key_ref.as_bytes(),
                },
            )
            .map_err(|_| CodecError::Decrypt("authentication failed".to_string()))
    }

    /// Encrypt a string and encode the envelope as base64.
    pub fn encrypt_to_string(&self, plaintext: &str, key_ref: &str) -> CodecResult<String> {
        let envelope = self.encrypt(plaintext.as_bytes(), key_ref)?;
        Ok(STANDARD.encode(envelope))
    }

    /// Decode a base64 envelope and decrypt it to a string.
    pub fn decrypt_to_string(&self, encoded: &str, key_ref: &str) -> CodecResult<String> {
        let envelope = STANDARD
            .decode(encoded)
            .map_err(|e| CodecError::Encoding(format!("invalid base64 envelope: {e}")))?;
        let plaintext = self.decrypt(&envelope, key_ref)?;
        String::from_utf8(plaintext)
            .map_err(|e| CodecError::Encoding(format!("plaintext is not valid UTF-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> CredentialCodec {
        CredentialCodec::new(
            KeyRing::new()
                .with_key("primary", [7u8; KEY_LENGTH])
                .with_key("rotated", [9u8; KEY_LENGTH]),
        )
    }

    #[test]
    fn test_string_envelope_opens_with_same_key() {
        let codec = codec();
        let sealed = codec
            .encrypt_to_string("postgres://shop:pw@db/shop_42", "primary")
            .unwrap();

        assert!(!sealed.contains("postgres"));
        assert_eq!(
            codec.decrypt_to_string(&sealed, "primary").unwrap(),
            "postgres://shop:pw@db/shop_42"
        );
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let codec = codec();
        let a = codec.encrypt(b"same", "primary").unwrap();
        let b = codec.encrypt(b"same", "primary").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_ref_fails() {
        let codec = codec();
        let sealed = codec.encrypt(b"secret", "primary").unwrap();
        assert!(matches!(
            codec.decrypt(&sealed, "rotated"),
            Err(CodecError::Decrypt(_))
        ));
    }

    #[test]
    fn test_unknown_key_ref() {
        let codec = codec();
        assert!(matches!(
            codec.encrypt(b"secret", "missing"),
            Err(CodecError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_tampered_envelope_fails() {
        let codec = codec();
        let mut sealed = codec.encrypt(b"secret", "primary").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(codec.decrypt(&sealed, "primary").is_err());
    }

    #[test]
    fn test_truncated_envelope_fails() {
        let codec = codec();
        assert!(matches!(
            codec.decrypt(&[ENVELOPE_VERSION, 1, 2, 3], "primary"),
            Err(CodecError::Decrypt(_))
        ));
    }

    #[test]
    fn test_key_ring_from_base64() {
        let encoded = KeyRing::generate_key();
        let ring = KeyRing::from_base64([("k1", encoded.as_str())]).unwrap();
        assert!(ring.contains("k1"));
        assert_eq!(ring.len(), 1);

        let short = STANDARD.encode([1u8; 16]);
        assert!(matches!(
            KeyRing::from_base64([("k2", short.as_str())]),
            Err(CodecError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_debug_does_not_print_key_material() {
        let ring = KeyRing::new().with_key("primary", [7u8; KEY_LENGTH]);
        let printed = format!("{ring:?}");
        assert!(printed.contains("primary"));
        assert!(!printed.contains("7, 7"));
    }
}
