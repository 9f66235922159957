//! Symmetric encryption parameterised by an `algorithm/mode/padding` spec
//! string, for example `AES/CBC/PKCS5`.
//!
//! Keys are 128-bit: raw key material longer than the block size (such as a
//! hashed DH secret) is truncated to it with [`SeaSpec::key_from_bytes`].

use std::fmt;
use std::str::FromStr;

use openssl::symm::{Cipher, Crypter, Mode};

use super::{random, CryptoError, Result};

const AES_BLOCK_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeaAlgorithm {
    Aes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeaMode {
    Ecb,
    Cbc,
    Ctr,
    Cfb,
    Ofb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeaPadding {
    Pkcs5,
    NoPadding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeaSpec {
    pub algorithm: SeaAlgorithm,
    pub mode: SeaMode,
    pub padding: SeaPadding,
}

impl SeaSpec {
    pub fn block_size(&self) -> usize {
        match self.algorithm {
            SeaAlgorithm::Aes => AES_BLOCK_SIZE,
        }
    }

    pub fn key_len(&self) -> usize {
        self.block_size()
    }

    /// True for every mode except ECB.
    pub fn cipher_mode_uses_iv(&self) -> bool {
        self.mode != SeaMode::Ecb
    }

    fn cipher(&self) -> Cipher {
        match (self.algorithm, self.mode) {
            (SeaAlgorithm::Aes, SeaMode::Ecb) => Cipher::aes_128_ecb(),
            (SeaAlgorithm::Aes, SeaMode::Cbc) => Cipher::aes_128_cbc(),
            (SeaAlgorithm::Aes, SeaMode::Ctr) => Cipher::aes_128_ctr(),
            (SeaAlgorithm::Aes, SeaMode::Cfb) => Cipher::aes_128_cfb128(),
            (SeaAlgorithm::Aes, SeaMode::Ofb) => Cipher::aes_128_ofb(),
        }
    }

    fn pads(&self) -> bool {
        matches!(self.mode, SeaMode::Ecb | SeaMode::Cbc) && self.padding == SeaPadding::Pkcs5
    }

    pub fn generate_key(&self) -> Result<Vec<u8>> {
        random::unpredictable_bytes(self.key_len())
    }

    /// Random block-sized IV.
    pub fn generate_iv(&self) -> Result<Vec<u8>> {
        random::unpredictable_bytes(self.block_size())
    }

    /// Truncate raw key material to the block size of the algorithm.
    pub fn key_from_bytes(&self, raw: &[u8]) -> Result<Vec<u8>> {
        if raw.len() < self.key_len() {
            return Err(CryptoError::BadKey(format!(
                "Key material too short: expected at least {}, got {}",
                self.key_len(),
                raw.len()
            )));
        }
        Ok(raw[..self.key_len()].to_vec())
    }

    pub fn encrypt(&self, buf: &[u8], key: &[u8], iv: Option<&[u8]>) -> Result<Vec<u8>> {
        self.run(Mode::Encrypt, buf, key, iv)
    }

    pub fn decrypt(&self, buf: &[u8], key: &[u8], iv: Option<&[u8]>) -> Result<Vec<u8>> {
        self.run(Mode::Decrypt, buf, key, iv)
    }

    fn run(&self, mode: Mode, buf: &[u8], key: &[u8], iv: Option<&[u8]>) -> Result<Vec<u8>> {
        if key.len() != self.key_len() {
            return Err(CryptoError::BadKey(format!(
                "Invalid key length: expected {}, got {}",
                self.key_len(),
                key.len()
            )));
        }
        match (self.cipher_mode_uses_iv(), iv) {
            (true, Some(iv)) if iv.len() != self.block_size() => {
                return Err(CryptoError::BadInput(format!(
                    "Invalid IV length: expected {}, got {}",
                    self.block_size(),
                    iv.len()
                )))
            }
            (true, None) => return Err(CryptoError::BadInput(format!("{} requires an IV", self))),
            (false, Some(_)) => {
                return Err(CryptoError::BadInput(format!("{} does not take an IV", self)))
            }
            _ => {}
        }
        if !self.pads() && self.block_aligned_only() && buf.len() % self.block_size() != 0 {
            return Err(CryptoError::BadInput(
                "Input is not a multiple of the block size".to_string(),
            ));
        }

        let cipher = self.cipher();
        let mut crypter = Crypter::new(cipher, mode, key, iv)
            .map_err(|e| CryptoError::BadKey(format!("Failed to initialise cipher: {}", e)))?;
        crypter.pad(self.pads());

        let mut out = vec![0u8; buf.len() + cipher.block_size()];
        let mut count = crypter
            .update(buf, &mut out)
            .map_err(|e| CryptoError::BadInput(format!("Cipher update failed: {}", e)))?;
        count += crypter
            .finalize(&mut out[count..])
            .map_err(|e| CryptoError::BadInput(format!("Cipher finalize failed: {}", e)))?;
        out.truncate(count);
        Ok(out)
    }

    fn block_aligned_only(&self) -> bool {
        matches!(self.mode, SeaMode::Ecb | SeaMode::Cbc)
    }
}

impl FromStr for SeaSpec {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        if parts.len() != 3 {
            return Err(CryptoError::BadInput(format!(
                "Cipher spec must be algorithm/mode/padding: {}",
                s
            )));
        }
        let algorithm = match parts[0].to_ascii_uppercase().as_str() {
            "AES" => SeaAlgorithm::Aes,
            other => return Err(CryptoError::BadInput(format!("Unknown cipher: {}", other))),
        };
        let mode = match parts[1].to_ascii_uppercase().as_str() {
            "ECB" => SeaMode::Ecb,
            "CBC" => SeaMode::Cbc,
            "CTR" => SeaMode::Ctr,
            "CFB" => SeaMode::Cfb,
            "OFB" => SeaMode::Ofb,
            other => return Err(CryptoError::BadInput(format!("Unknown mode: {}", other))),
        };
        let padding = match parts[2].to_ascii_uppercase().as_str() {
            "PKCS5" | "PKCS5PADDING" | "PKCS7" | "PKCS7PADDING" => SeaPadding::Pkcs5,
            "NOPADDING" => SeaPadding::NoPadding,
            other => return Err(CryptoError::BadInput(format!("Unknown padding: {}", other))),
        };
        Ok(Self {
            algorithm,
            mode,
            padding,
        })
    }
}

impl fmt::Display for SeaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            SeaMode::Ecb => "ECB",
            SeaMode::Cbc => "CBC",
            SeaMode::Ctr => "CTR",
            SeaMode::Cfb => "CFB",
            SeaMode::Ofb => "OFB",
        };
        let padding = match self.padding {
            SeaPadding::Pkcs5 => "PKCS5",
            SeaPadding::NoPadding => "NoPadding",
        };
        write!(f, "AES/{}/{}", mode, padding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: [&str; 7] = [
        "AES/ECB/PKCS5",
        "AES/CBC/PKCS5",
        "AES/CTR/NoPadding",
        "AES/CFB/NoPadding",
        "AES/OFB/NoPadding",
        "AES/ECB/NoPadding",
        "AES/CBC/NoPadding",
    ];

    fn roundtrip(spec: &SeaSpec, plaintext: &[u8]) {
        let key = spec.generate_key().unwrap();
        let iv = if spec.cipher_mode_uses_iv() {
            Some(spec.generate_iv().unwrap())
        } else {
            None
        };
        let ct = spec.encrypt(plaintext, &key, iv.as_deref()).unwrap();
        let pt = spec.decrypt(&ct, &key, iv.as_deref()).unwrap();
        assert_eq!(pt, plaintext, "{}", spec);
    }

    #[test]
    fn test_every_supported_spec_roundtrips() {
        for name in SPECS {
            let spec: SeaSpec = name.parse().unwrap();
            roundtrip(&spec, &[0x42; 48]);
            if spec.pads() || !spec.block_aligned_only() {
                roundtrip(&spec, b"");
                roundtrip(&spec, b"odd sized message!");
            }
        }
    }

    #[test]
    fn test_iv_rules() {
        let ecb: SeaSpec = "AES/ECB/PKCS5".parse().unwrap();
        let cbc: SeaSpec = "AES/CBC/PKCS5".parse().unwrap();
        assert!(!ecb.cipher_mode_uses_iv());
        assert!(cbc.cipher_mode_uses_iv());

        let key = cbc.generate_key().unwrap();
        assert!(matches!(
            cbc.encrypt(b"x", &key, None),
            Err(CryptoError::BadInput(_))
        ));
        assert!(ecb.encrypt(b"x", &key, Some(&[0u8; 16])).is_err());
        assert_eq!(cbc.generate_iv().unwrap().len(), 16);
    }

    #[test]
    fn test_key_truncated_to_block_size() {
        let spec: SeaSpec = "AES/CBC/PKCS5".parse().unwrap();
        let key = spec.key_from_bytes(&[9u8; 32]).unwrap();
        assert_eq!(key, vec![9u8; 16]);
        assert!(spec.key_from_bytes(&[1u8; 8]).is_err());
        assert!(spec.encrypt(b"data", &[0u8; 32], Some(&[0u8; 16])).is_err());
    }

    #[test]
    fn test_wrong_key_does_not_yield_plaintext() {
        let spec: SeaSpec = "AES/CBC/PKCS5".parse().unwrap();
        let key = spec.generate_key().unwrap();
        let other = spec.generate_key().unwrap();
        let iv = spec.generate_iv().unwrap();
        let ct = spec.encrypt(b"attack at dawn", &key, Some(&iv)).unwrap();
        match spec.decrypt(&ct, &other, Some(&iv)) {
            Ok(pt) => assert_ne!(pt, b"attack at dawn"),
            Err(e) => assert!(matches!(e, CryptoError::BadInput(_))),
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("AES/CBC".parse::<SeaSpec>().is_err());
        assert!("DES/CBC/PKCS5".parse::<SeaSpec>().is_err());
        assert!("AES/XTS/PKCS5".parse::<SeaSpec>().is_err());
        assert_eq!(
            "aes/cbc/pkcs5padding".parse::<SeaSpec>().unwrap().to_string(),
            "AES/CBC/PKCS5"
        );
    }
}
