//! Crypto toolkit.
//!
//! Pure functions over byte strings built on the `openssl` crate: symmetric
//! ciphers, MACs, digests, Diffie-Hellman agreement, signatures, randomness,
//! base64 framing and X.509 handling. Nothing in here performs I/O.
//!
//! Cipher, MAC and digest values are created per operation, so any number of
//! worker threads can use these helpers without sharing OpenSSL contexts.

pub mod certificate;
pub mod dh;
pub mod encoding;
pub mod hash;
pub mod mac;
pub mod random;
pub mod sea;
pub mod signature;

use thiserror::Error;

pub use certificate::{
    extract_public_key, extract_serial, parse_chain, public_key_der, valid_at, verify_chain,
};
pub use dh::{DhKeyPair, DhParams};
pub use hash::HashAlgorithm;
pub use mac::MacAlgorithm;
pub use sea::SeaSpec;
pub use signature::SignatureAlgorithm;

/// Errors that can occur during cryptographic operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Malformed input (bad encoding, wrong length, unknown algorithm name).
    #[error("Bad input: {0}")]
    BadInput(String),

    /// Key material could not be used with the requested operation.
    #[error("Bad key: {0}")]
    BadKey(String),

    /// A signature, MAC or certificate chain did not verify.
    #[error("Bad signature: {0}")]
    BadSignature(String),

    /// The underlying provider failed or does not support the operation.
    #[error("Crypto unavailable: {0}")]
    CryptoUnavailable(String),
}

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
