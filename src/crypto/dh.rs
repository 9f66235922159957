//! Finite-field Diffie-Hellman.
//!
//! Public keys travel as the big-endian bytes of the public value. The shared
//! secret is always hashed before use; [`DhKeyPair::agree_and_digest`] is the
//! only way to obtain it.

use openssl::bn::{BigNum, BigNumRef};
use openssl::dh::Dh;
use openssl::pkey::{Params, Private};

use super::hash::HashAlgorithm;
use super::{encoding, CryptoError, Result};

const DH_GENERATOR: u32 = 2;

/// Group parameters (prime `p`, generator `g`).
pub struct DhParams {
    p: BigNum,
    g: BigNum,
}

impl DhParams {
    /// Generate fresh parameters with a `key_size`-bit safe prime. Slow for
    /// realistic sizes.
    pub fn generate(key_size: u32) -> Result<Self> {
        let dh = Dh::generate_params(key_size, DH_GENERATOR).map_err(|e| {
            CryptoError::CryptoUnavailable(format!("DH parameter generation failed: {}", e))
        })?;
        Self::from_dh(&dh)
    }

    /// The RFC 5114 2048-bit MODP group with 256-bit subgroup.
    pub fn rfc5114_2048_256() -> Result<Self> {
        let dh = Dh::get_2048_256()
            .map_err(|e| CryptoError::CryptoUnavailable(format!("{}", e)))?;
        Self::from_dh(&dh)
    }

    fn from_dh(dh: &Dh<Params>) -> Result<Self> {
        let copy = |n: &BigNumRef| {
            n.to_owned()
                .map_err(|e| CryptoError::CryptoUnavailable(format!("{}", e)))
        };
        Ok(Self {
            p: copy(dh.prime_p())?,
            g: copy(dh.generator())?,
        })
    }

    pub fn from_bytes(p: &[u8], g: &[u8]) -> Result<Self> {
        let p = BigNum::from_slice(p).map_err(|e| CryptoError::BadInput(format!("{}", e)))?;
        let g = BigNum::from_slice(g).map_err(|e| CryptoError::BadInput(format!("{}", e)))?;
        if p.num_bits() < 2 || g.num_bits() < 2 {
            return Err(CryptoError::BadInput("Degenerate DH parameters".to_string()));
        }
        Ok(Self { p, g })
    }

    /// Parameters as published in the server parameter map.
    pub fn from_encoded(p: &str, g: &str) -> Result<Self> {
        Self::from_bytes(&encoding::decode(p)?, &encoding::decode(g)?)
    }

    pub fn p_bytes(&self) -> Vec<u8> {
        self.p.to_vec()
    }

    pub fn g_bytes(&self) -> Vec<u8> {
        self.g.to_vec()
    }

    pub fn key_size(&self) -> i32 {
        self.p.num_bits()
    }

    fn to_dh(&self) -> Result<Dh<Params>> {
        let copy = |n: &BigNumRef| {
            n.to_owned()
                .map_err(|e| CryptoError::CryptoUnavailable(format!("{}", e)))
        };
        Dh::from_pqg(copy(&self.p)?, None, copy(&self.g)?)
            .map_err(|e| CryptoError::BadInput(format!("Invalid DH parameters: {}", e)))
    }

    pub fn gen_key_pair(&self) -> Result<DhKeyPair> {
        let dh = self
            .to_dh()?
            .generate_key()
            .map_err(|e| CryptoError::CryptoUnavailable(format!("DH key generation failed: {}", e)))?;
        Ok(DhKeyPair { dh })
    }

    /// Rebuild a key pair from a stored private value.
    pub fn key_pair_from_private(&self, private: &[u8]) -> Result<DhKeyPair> {
        let priv_key =
            BigNum::from_slice(private).map_err(|e| CryptoError::BadKey(format!("{}", e)))?;
        let dh = self
            .to_dh()?
            .set_private_key(priv_key)
            .map_err(|e| CryptoError::BadKey(format!("{}", e)))?;
        Ok(DhKeyPair { dh })
    }
}

/// A DH key pair bound to one parameter set.
pub struct DhKeyPair {
    dh: Dh<Private>,
}

impl DhKeyPair {
    pub fn public_key(&self) -> Vec<u8> {
        self.dh.public_key().to_vec()
    }

    pub fn public_key_encoded(&self) -> String {
        encoding::encode(&self.public_key())
    }

    pub fn private_key(&self) -> Vec<u8> {
        self.dh.private_key().to_vec()
    }

    /// Agree with `peer_public` and hash the shared secret with `digest`.
    pub fn agree_and_digest(&self, peer_public: &[u8], digest: HashAlgorithm) -> Result<Vec<u8>> {
        if peer_public.is_empty() {
            return Err(CryptoError::BadKey("Empty DH public key".to_string()));
        }
        let peer = BigNum::from_slice(peer_public)
            .map_err(|e| CryptoError::BadKey(format!("{}", e)))?;
        let secret = self
            .dh
            .compute_key(&peer)
            .map_err(|e| CryptoError::BadKey(format!("DH agreement failed: {}", e)))?;
        digest.digest(&secret)
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("public_key", &self.public_key_encoded())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let params = DhParams::rfc5114_2048_256().unwrap();
        let alice = params.gen_key_pair().unwrap();
        let bob = params.gen_key_pair().unwrap();

        let k1 = alice
            .agree_and_digest(&bob.public_key(), HashAlgorithm::Sha256)
            .unwrap();
        let k2 = bob
            .agree_and_digest(&alice.public_key(), HashAlgorithm::Sha256)
            .unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 32);
    }

    #[test]
    fn test_group_copied_into_fresh_dh() {
        let params = DhParams::rfc5114_2048_256().unwrap();
        let dh = params.to_dh().unwrap();
        assert_eq!(dh.prime_p().to_vec(), params.p_bytes());
        assert_eq!(dh.generator().to_vec(), params.g_bytes());
        assert_eq!(params.key_size(), 2048);
    }

    #[test]
    fn test_generated_parameters() {
        let params = DhParams::generate(512).unwrap();
        assert_eq!(params.key_size(), 512);

        let encoded_p = encoding::encode(&params.p_bytes());
        let encoded_g = encoding::encode(&params.g_bytes());
        let restored = DhParams::from_encoded(&encoded_p, &encoded_g).unwrap();
        let a = restored.gen_key_pair().unwrap();
        let b = params.gen_key_pair().unwrap();
        assert_eq!(
            a.agree_and_digest(&b.public_key(), HashAlgorithm::Sha256).unwrap(),
            b.agree_and_digest(&a.public_key(), HashAlgorithm::Sha256).unwrap()
        );
    }

    #[test]
    fn test_key_pair_restored_from_private_value() {
        let params = DhParams::rfc5114_2048_256().unwrap();
        let original = params.gen_key_pair().unwrap();
        let restored = params.key_pair_from_private(&original.private_key()).unwrap();
        assert_eq!(original.public_key(), restored.public_key());
    }

    #[test]
    fn test_empty_peer_key_rejected() {
        let params = DhParams::rfc5114_2048_256().unwrap();
        let pair = params.gen_key_pair().unwrap();
        assert!(pair.agree_and_digest(&[], HashAlgorithm::Sha256).is_err());
    }
}
