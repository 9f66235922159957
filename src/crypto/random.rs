//! CSPRNG access.
//!
//! Key and IV material comes from OpenSSL's private generator; nonces and other
//! values that are sent in the clear come from the public one.

use super::{encoding, CryptoError, Result};

/// Bytes suitable for keys and IVs.
pub fn unpredictable_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_priv_bytes(&mut buf)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("Private RNG failed: {}", e)))?;
    Ok(buf)
}

/// Bytes that are not secret, such as request nonces.
pub fn non_secret_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    openssl::rand::rand_bytes(&mut buf)
        .map_err(|e| CryptoError::CryptoUnavailable(format!("Public RNG failed: {}", e)))?;
    Ok(buf)
}

const NONCE_SIZE: usize = 16;

/// A fresh base64 request nonce.
pub fn new_nonce() -> Result<String> {
    Ok(encoding::encode(&non_secret_bytes(NONCE_SIZE)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lengths_and_freshness() {
        assert_eq!(unpredictable_bytes(24).unwrap().len(), 24);
        assert_ne!(new_nonce().unwrap(), new_nonce().unwrap());
    }
}
