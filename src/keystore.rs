//! Keystore and truststore loading.
//!
//! The private key is held inside a `secrecy::Secret` as DER and only turned
//! back into an OpenSSL key for the duration of an operation, so the key
//! material is zeroized on drop and never shows up in debug output.

use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use secrecy::{ExposeSecret, Secret, SecretString, Zeroize};
use std::fmt;
use std::path::Path;

use crate::configs::{KeystoreConfig, StoreType};
use crate::error::ServiceError;

/// A securely stored private key that implements Zeroize
#[derive(Clone)]
struct SecurePrivateKey {
    der_bytes: Vec<u8>,
}

impl Zeroize for SecurePrivateKey {
    fn zeroize(&mut self) {
        self.der_bytes.zeroize();
    }
}

impl fmt::Debug for SecurePrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurePrivateKey")
            .field("der_bytes", &"<redacted>")
            .finish()
    }
}

fn invalid(message: String) -> ServiceError {
    ServiceError::InvalidConfiguration(message)
}

fn read_file(path: &Path, what: &str) -> Result<Vec<u8>, ServiceError> {
    std::fs::read(path).map_err(|e| {
        invalid(format!(
            "Failed to read {} from {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

/// A private key with its certificate chain (leaf first).
pub struct KeyStore {
    private_key: Secret<SecurePrivateKey>,
    chain: Vec<X509>,
}

impl KeyStore {
    /// Create a KeyStore from a key and its certificate chain
    ///
    /// # Arguments
    /// * `key` - The private key to store securely
    /// * `chain` - Leaf certificate followed by any intermediates
    pub fn new(key: PKey<Private>, chain: Vec<X509>) -> Result<Self, ServiceError> {
        if chain.is_empty() {
            return Err(invalid("Keystore holds no certificate".to_string()));
        }
        let der_bytes = key
            .private_key_to_der()
            .map_err(|e| invalid(format!("Failed to convert private key to DER: {}", e)))?;
        Ok(Self {
            private_key: Secret::new(SecurePrivateKey { der_bytes }),
            chain,
        })
    }

    /// Load according to the configured container type.
    pub fn load(config: &KeystoreConfig) -> Result<Self, ServiceError> {
        match config.store_type {
            StoreType::Pkcs12 => Self::from_pkcs12_file(&config.location, config.password.as_ref()),
            StoreType::Pem => Self::from_pem_file(&config.location, config.password.as_ref()),
        }
    }

    /// Load a PKCS#12 bundle holding the key, its certificate and CA chain.
    pub fn from_pkcs12_file(
        path: &Path,
        password: Option<&SecretString>,
    ) -> Result<Self, ServiceError> {
        let der = read_file(path, "keystore")?;
        let password = password.map(|p| p.expose_secret().as_str()).unwrap_or("");
        let parsed = Pkcs12::from_der(&der)
            .and_then(|p12| p12.parse2(password))
            .map_err(|e| invalid(format!("Failed to open PKCS#12 keystore: {}", e)))?;

        let key = parsed
            .pkey
            .ok_or_else(|| invalid("PKCS#12 keystore holds no private key".to_string()))?;
        let leaf = parsed
            .cert
            .ok_or_else(|| invalid("PKCS#12 keystore holds no certificate".to_string()))?;
        let mut chain = vec![leaf];
        if let Some(ca) = parsed.ca {
            chain.extend(ca);
        }
        Self::new(key, chain)
    }

    /// Load a PEM file holding the private key and the certificate chain.
    ///
    /// # Arguments
    /// * `path` - Path to the PEM file
    /// * `password` - Optional password if the key is encrypted
    pub fn from_pem_file(path: &Path, password: Option<&SecretString>) -> Result<Self, ServiceError> {
        let pem_data = read_file(path, "keystore")?;

        let key = match password {
            Some(pwd) => {
                PKey::private_key_from_pem_passphrase(&pem_data, pwd.expose_secret().as_bytes())
                    .map_err(|e| invalid(format!("Failed to decrypt private key with password: {}", e)))?
            }
            None => PKey::private_key_from_pem(&pem_data)
                .map_err(|e| invalid(format!("Failed to parse private key PEM: {}", e)))?,
        };
        let chain = X509::stack_from_pem(&pem_data)
            .map_err(|e| invalid(format!("Failed to parse certificate PEM: {}", e)))?;
        Self::new(key, chain)
    }

    /// Reconstruct the private key for a single operation.
    pub fn private_key(&self) -> Result<PKey<Private>, ServiceError> {
        let der_bytes = &self.private_key.expose_secret().der_bytes;
        PKey::private_key_from_der(der_bytes).map_err(|e| {
            invalid(format!(
                "Failed to reconstruct private key from secure storage: {}",
                e
            ))
        })
    }

    /// The leaf certificate.
    pub fn certificate(&self) -> &X509 {
        &self.chain[0]
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }
}

impl fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyStore")
            .field("private_key", &"<securely stored>")
            .field(
                "certificate",
                &crate::crypto::certificate::subject_common_name(self.certificate()),
            )
            .finish()
    }
}

/// Trust anchors used to validate peer certificates.
#[derive(Clone)]
pub struct TrustStore {
    anchors: Vec<X509>,
}

impl TrustStore {
    pub fn new(anchors: Vec<X509>) -> Result<Self, ServiceError> {
        if anchors.is_empty() {
            return Err(invalid("Truststore holds no certificate".to_string()));
        }
        Ok(Self { anchors })
    }

    pub fn load(config: &KeystoreConfig) -> Result<Self, ServiceError> {
        let bytes = read_file(&config.location, "truststore")?;
        match config.store_type {
            StoreType::Pem => {
                let anchors = X509::stack_from_pem(&bytes)
                    .map_err(|e| invalid(format!("Failed to parse truststore PEM: {}", e)))?;
                Self::new(anchors)
            }
            StoreType::Pkcs12 => {
                let password = config
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().as_str())
                    .unwrap_or("");
                let parsed = Pkcs12::from_der(&bytes)
                    .and_then(|p12| p12.parse2(password))
                    .map_err(|e| invalid(format!("Failed to open PKCS#12 truststore: {}", e)))?;
                let mut anchors: Vec<X509> = parsed.cert.into_iter().collect();
                if let Some(ca) = parsed.ca {
                    anchors.extend(ca);
                }
                Self::new(anchors)
            }
        }
    }

    pub fn anchors(&self) -> &[X509] {
        &self.anchors
    }
}

impl fmt::Debug for TrustStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustStore")
            .field("anchors", &self.anchors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::certificate::test_support::{rsa_key, self_signed};
    use openssl::stack::Stack;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_debug_no_leak() {
        let key = rsa_key();
        let cert = self_signed("Keystore Test", &key);
        let store = KeyStore::new(key, vec![cert]).unwrap();

        let debug_str = format!("{:?}", store);
        assert!(!debug_str.contains("der_bytes"));
        assert!(debug_str.contains("securely stored"));
        assert!(debug_str.contains("Keystore Test"));
    }

    #[test]
    fn test_pem_keystore_roundtrip() {
        let key = rsa_key();
        let cert = self_signed("PEM Store", &key);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        file.write_all(&cert.to_pem().unwrap()).unwrap();

        let store = KeyStore::from_pem_file(file.path(), None).unwrap();
        assert_eq!(store.chain().len(), 1);
        assert_eq!(
            store.private_key().unwrap().public_key_to_der().unwrap(),
            key.public_key_to_der().unwrap()
        );
    }

    #[test]
    fn test_pkcs12_keystore_and_truststore() {
        let ca_key = rsa_key();
        let ca = self_signed("P12 CA", &ca_key);

        let mut ca_stack = Stack::new().unwrap();
        ca_stack.push(ca.clone()).unwrap();
        let mut builder = Pkcs12::builder();
        builder.name("server");
        builder.pkey(&ca_key);
        builder.cert(&ca);
        builder.ca(ca_stack);
        let p12 = builder.build2("secret").unwrap();

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&p12.to_der().unwrap()).unwrap();

        let password = SecretString::new("secret".to_string());
        let store = KeyStore::from_pkcs12_file(file.path(), Some(&password)).unwrap();
        assert_eq!(store.chain().len(), 2);

        let wrong = SecretString::new("wrong".to_string());
        assert!(matches!(
            KeyStore::from_pkcs12_file(file.path(), Some(&wrong)),
            Err(ServiceError::InvalidConfiguration(_))
        ));

        let config = KeystoreConfig {
            location: file.path().to_path_buf(),
            store_type: StoreType::Pkcs12,
            password: Some(password),
        };
        let trust = TrustStore::load(&config).unwrap();
        assert_eq!(trust.anchors().len(), 2);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let config = KeystoreConfig {
            location: "/nonexistent/keystore.pem".into(),
            store_type: StoreType::Pem,
            password: None,
        };
        assert!(matches!(
            TrustStore::load(&config),
            Err(ServiceError::InvalidConfiguration(_))
        ));
    }
}
