//! Digital signatures with the long-term certificate keys.

use std::fmt;
use std::str::FromStr;

use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::sign::{Signer, Verifier};

use super::hash::HashAlgorithm;
use super::{encoding, CryptoError, Result};

/// `<digest>with<RSA|ECDSA>`, the same names used for certificate signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureAlgorithm {
    digest: HashAlgorithm,
    family: KeyFamily,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Rsa,
    Ecdsa,
}

impl SignatureAlgorithm {
    pub const SHA256_WITH_RSA: SignatureAlgorithm = SignatureAlgorithm {
        digest: HashAlgorithm::Sha256,
        family: KeyFamily::Rsa,
    };

    pub fn digest(&self) -> HashAlgorithm {
        self.digest
    }

    fn check_key<T: HasPublic>(&self, key: &PKeyRef<T>) -> Result<()> {
        let id = key.id();
        let ok = match self.family {
            KeyFamily::Rsa => id == openssl::pkey::Id::RSA,
            KeyFamily::Ecdsa => id == openssl::pkey::Id::EC,
        };
        if ok {
            Ok(())
        } else {
            Err(CryptoError::BadKey(format!("Key type does not match {}", self)))
        }
    }

    pub fn sign(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<Vec<u8>> {
        self.check_key(key)?;
        let mut signer = Signer::new(self.digest.message_digest(), key)
            .map_err(|e| CryptoError::BadKey(format!("Failed to create signer: {}", e)))?;
        signer
            .sign_oneshot_to_vec(data)
            .map_err(|e| CryptoError::CryptoUnavailable(format!("Signing failed: {}", e)))
    }

    /// `Ok(false)` for any signature that does not verify, including
    /// structurally broken ones.
    pub fn verify<T: HasPublic>(&self, data: &[u8], signature: &[u8], key: &PKeyRef<T>) -> Result<bool> {
        self.check_key(key)?;
        let mut verifier = Verifier::new(self.digest.message_digest(), key)
            .map_err(|e| CryptoError::BadKey(format!("Failed to create verifier: {}", e)))?;
        Ok(verifier.verify_oneshot(signature, data).unwrap_or(false))
    }

    pub fn sign_encoded(&self, data: &[u8], key: &PKeyRef<Private>) -> Result<String> {
        Ok(encoding::encode(&self.sign(data, key)?))
    }

    /// Verify a base64 signature under a DER (SubjectPublicKeyInfo) public
    /// key, as stored for mailboxes.
    pub fn verify_encoded(&self, data: &[u8], signature: &str, public_key_der: &[u8]) -> Result<bool> {
        let signature = encoding::decode(signature)?;
        let key = PKey::public_key_from_der(public_key_der)
            .map_err(|e| CryptoError::BadKey(format!("Invalid public key: {}", e)))?;
        self.verify(data, &signature, &key)
    }

    /// Like [`SignatureAlgorithm::verify_encoded`] but a mismatch is an error.
    pub fn require_valid(&self, data: &[u8], signature: &str, public_key_der: &[u8]) -> Result<()> {
        if self.verify_encoded(data, signature, public_key_der)? {
            Ok(())
        } else {
            Err(CryptoError::BadSignature("Signature does not verify".to_string()))
        }
    }
}

impl Default for SignatureAlgorithm {
    fn default() -> Self {
        Self::SHA256_WITH_RSA
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_ascii_lowercase();
        let (digest, family) = lower
            .split_once("with")
            .ok_or_else(|| CryptoError::BadInput(format!("Unknown signature algorithm: {}", s)))?;
        let family = match family {
            "rsa" => KeyFamily::Rsa,
            "ecdsa" => KeyFamily::Ecdsa,
            _ => {
                return Err(CryptoError::BadInput(format!(
                    "Unknown signature algorithm: {}",
                    s
                )))
            }
        };
        Ok(Self {
            digest: digest.parse()?,
            family,
        })
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.family {
            KeyFamily::Rsa => "RSA",
            KeyFamily::Ecdsa => "ECDSA",
        };
        write!(f, "{}with{}", self.digest.to_string().replace('-', ""), family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::nid::Nid;
    use openssl::rsa::Rsa;
    use proptest::prelude::*;
    use std::sync::OnceLock;

    fn rsa_key() -> &'static PKey<Private> {
        static KEY: OnceLock<PKey<Private>> = OnceLock::new();
        KEY.get_or_init(|| PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap())
    }

    #[test]
    fn test_sign_verify() {
        let alg = SignatureAlgorithm::default();
        let key = rsa_key();
        let sig = alg.sign(b"secondary data", key).unwrap();
        assert!(alg.verify(b"secondary data", &sig, key).unwrap());
        assert!(!alg.verify(b"secondary datA", &sig, key).unwrap());
        assert!(!alg.verify(b"secondary data", &sig[..10], key).unwrap());
    }

    #[test]
    fn test_verify_encoded_against_der_key() {
        let alg: SignatureAlgorithm = "SHA256withRSA".parse().unwrap();
        let key = rsa_key();
        let der = key.public_key_to_der().unwrap();
        let sig = alg.sign_encoded(b"message", key).unwrap();
        assert!(alg.require_valid(b"message", &sig, &der).is_ok());
        assert!(matches!(
            alg.require_valid(b"massage", &sig, &der),
            Err(CryptoError::BadSignature(_))
        ));
    }

    #[test]
    fn test_ecdsa_and_family_mismatch() {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let ec = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();
        let ecdsa: SignatureAlgorithm = "SHA256withECDSA".parse().unwrap();
        let sig = ecdsa.sign(b"m", &ec).unwrap();
        assert!(ecdsa.verify(b"m", &sig, &ec).unwrap());

        let rsa = SignatureAlgorithm::default();
        assert!(matches!(rsa.sign(b"m", &ec), Err(CryptoError::BadKey(_))));
    }

    #[test]
    fn test_names() {
        assert_eq!(SignatureAlgorithm::default().to_string(), "SHA256withRSA");
        assert_eq!(
            "SHA512withRSA".parse::<SignatureAlgorithm>().unwrap().to_string(),
            "SHA512withRSA"
        );
        assert!("SHA256withDSA".parse::<SignatureAlgorithm>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Flipping any single bit of the message or signature breaks verification.
        #[test]
        fn flipped_bits_fail(message in prop::collection::vec(any::<u8>(), 1..64), bit in any::<usize>()) {
            let alg = SignatureAlgorithm::default();
            let key = rsa_key();
            let sig = alg.sign(&message, key).unwrap();

            let mut bad_message = message.clone();
            let i = bit % (bad_message.len() * 8);
            bad_message[i / 8] ^= 1 << (i % 8);
            prop_assert!(!alg.verify(&bad_message, &sig, key).unwrap());

            let mut bad_sig = sig.clone();
            let j = bit % (bad_sig.len() * 8);
            bad_sig[j / 8] ^= 1 << (j % 8);
            prop_assert!(!alg.verify(&message, &bad_sig, key).unwrap());
        }
    }
}
