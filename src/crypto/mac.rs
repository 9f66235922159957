//! HMAC over the digests of [`HashAlgorithm`].

use std::fmt;
use std::str::FromStr;

use openssl::pkey::PKey;
use openssl::sign::Signer;

use super::hash::HashAlgorithm;
use super::{random, CryptoError, Result};

/// A MAC spec such as `HmacSHA256`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAlgorithm {
    digest: HashAlgorithm,
}

impl MacAlgorithm {
    pub fn new(digest: HashAlgorithm) -> Self {
        Self { digest }
    }

    pub fn output_len(&self) -> usize {
        self.digest.output_len()
    }

    pub fn mac_hash(&self, data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(CryptoError::BadKey("Empty MAC key".to_string()));
        }
        let pkey = PKey::hmac(key).map_err(|e| CryptoError::BadKey(format!("{}", e)))?;
        let mut signer = Signer::new(self.digest.message_digest(), &pkey)
            .map_err(|e| CryptoError::CryptoUnavailable(format!("{}", e)))?;
        signer
            .sign_oneshot_to_vec(data)
            .map_err(|e| CryptoError::CryptoUnavailable(format!("MAC failed: {}", e)))
    }

    /// Constant-time tag check.
    pub fn verify(&self, data: &[u8], mac: &[u8], key: &[u8]) -> Result<bool> {
        let expected = self.mac_hash(data, key)?;
        Ok(expected.len() == mac.len() && openssl::memcmp::eq(&expected, mac))
    }

    /// Random key as long as the MAC output.
    pub fn generate_key(&self) -> Result<Vec<u8>> {
        random::unpredictable_bytes(self.output_len())
    }
}

impl FromStr for MacAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let digest = s
            .strip_prefix("Hmac")
            .or_else(|| s.strip_prefix("HMAC"))
            .ok_or_else(|| CryptoError::BadInput(format!("Unknown MAC: {}", s)))?;
        Ok(Self::new(digest.parse()?))
    }
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digest = self.digest.to_string().replace('-', "");
        write!(f, "Hmac{}", digest)
    }
}
