//! Session token identifiers.
//!
//! Tokens are handed to clients once; only their SHA-256 digest is stored.
//! Verification compares digests in constant time.

use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_BYTES: usize = 32;
const DOMAIN: &[u8] = b"shopgate.token.v1:";

/// Generate a fresh, URL-safe token identifier with 256 bits of entropy.
pub fn generate_token_id() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a token identifier for storage.
pub fn hash_token_id(token_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN);
    hasher.update(token_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a presented token against a stored digest.
pub fn verify_token_id(presented: &str, stored_hash: &str) -> bool {
    let computed = hash_token_id(presented);
    computed.as_bytes().ct_eq(stored_hash.as_bytes()).into()
}
