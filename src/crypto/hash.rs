//! Message digests.

use std::fmt;
use std::str::FromStr;

use openssl::hash::MessageDigest;

use super::{encoding, CryptoError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub(crate) fn message_digest(self) -> MessageDigest {
        match self {
            HashAlgorithm::Sha256 => MessageDigest::sha256(),
            HashAlgorithm::Sha384 => MessageDigest::sha384(),
            HashAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn output_len(self) -> usize {
        self.message_digest().size()
    }

    pub fn digest(self, data: &[u8]) -> Result<Vec<u8>> {
        openssl::hash::hash(self.message_digest(), data)
            .map(|d| d.to_vec())
            .map_err(|e| CryptoError::CryptoUnavailable(format!("Digest failed: {}", e)))
    }

    /// Constant-time comparison of `expected` against the digest of `data`.
    pub fn verify(self, data: &[u8], expected: &[u8]) -> Result<bool> {
        let actual = self.digest(data)?;
        Ok(actual.len() == expected.len() && openssl::memcmp::eq(&actual, expected))
    }

    /// Verify base64 data against a base64 digest; neither string may decode
    /// to more than `max_data_len` / the digest length.
    pub fn verify_encoded(self, data: &str, expected: &str, max_data_len: usize) -> Result<bool> {
        let data = encoding::decode_bounded(data, max_data_len)?;
        let expected = encoding::decode_bounded(expected, self.output_len())?;
        self.verify(&data, &expected)
    }
}

impl FromStr for HashAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "").as_str() {
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(CryptoError::BadInput(format!("Unknown digest: {}", s))),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_and_verify() {
        let digest = HashAlgorithm::Sha256.digest(b"abc").unwrap();
        assert_eq!(digest.len(), 32);
        assert!(HashAlgorithm::Sha256.verify(b"abc", &digest).unwrap());
        assert!(!HashAlgorithm::Sha256.verify(b"abd", &digest).unwrap());
        assert!(!HashAlgorithm::Sha256.verify(b"abc", &digest[..31]).unwrap());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("SHA-256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("sha512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
        assert!("MD5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn test_verify_encoded_is_bounded() {
        let data = encoding::encode(&[1u8; 64]);
        let digest = encoding::encode(&HashAlgorithm::Sha256.digest(&[1u8; 64]).unwrap());
        assert!(HashAlgorithm::Sha256.verify_encoded(&data, &digest, 64).unwrap());
        assert!(HashAlgorithm::Sha256.verify_encoded(&data, &digest, 10).is_err());
    }
}
