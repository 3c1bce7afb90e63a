//! Error types for credential encoding.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Credential codec errors.
///
/// Messages never include key material or plaintext.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No key registered under the requested reference
    #[error("Unknown key reference: {0}")]
    UnknownKey(String),

    /// Key material has the wrong length or encoding
    #[error("Invalid key material for {key_ref}: {reason}")]
    InvalidKey { key_ref: String, reason: String },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Ciphertext was truncated, tampered with, or sealed under another key
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Envelope or plaintext encoding error
    #[error("Encoding error: {0}")]
    Encoding(String),
}
