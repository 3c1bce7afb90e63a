//! Credential encryption and token hashing for shopgate.
//!
//! - [`CredentialCodec`] seals tenant connection strings and secrets with
//!   AES-256-GCM under a key chosen by reference.
//! - [`hash_token_id`] / [`verify_token_id`] keep rotating session tokens
//!   out of storage in plaintext.
//!
//! ```
//! use shopgate_crypto::{CredentialCodec, KeyRing};
//!
//! let ring = KeyRing::from_base64([("primary", KeyRing::generate_key().as_str())]).unwrap();
//! let codec = CredentialCodec::new(ring);
//!
//! let sealed = codec.encrypt_to_string("postgres://db/shop", "primary").unwrap();
//! assert_eq!(codec.decrypt_to_string(&sealed, "primary").unwrap(), "postgres://db/shop");
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod token;

pub use codec::{CredentialCodec, KEY_LENGTH, KeyRing};
pub use config::KeyRingConfig;
pub use error::{CodecError, CodecResult};
pub use token::{generate_token_id, hash_token_id, verify_token_id};
