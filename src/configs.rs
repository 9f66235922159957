//! TOML configuration for the PKI service, the message server and the client.

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ServiceError;

/// Container format of a keystore or truststore file.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreType {
    #[default]
    #[serde(rename = "PKCS12", alias = "pkcs12")]
    Pkcs12,
    #[serde(rename = "PEM", alias = "pem")]
    Pem,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KeystoreConfig {
    pub location: PathBuf,
    #[serde(rename = "type", default)]
    pub store_type: StoreType,
    #[serde(default)]
    pub password: Option<SecretString>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    #[serde(default = "default_protocols")]
    pub protocols: Vec<String>,
    /// OpenSSL cipher names; `TLS_AES_*`/`TLS_CHACHA20_*` entries configure
    /// TLS 1.3, the rest TLS 1.2. Empty means library defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,
    #[serde(default = "default_true")]
    pub mutual_auth: bool,
    #[serde(default)]
    pub verify_hostname: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            protocols: default_protocols(),
            cipher_suites: Vec::new(),
            mutual_auth: true,
            verify_hostname: false,
        }
    }
}

pub const SUPPORTED_PROTOCOLS: [&str; 2] = ["TLSv1.2", "TLSv1.3"];

fn default_protocols() -> Vec<String> {
    SUPPORTED_PROTOCOLS.iter().map(|p| p.to_string()).collect()
}

fn default_true() -> bool {
    true
}

/// Linkage from the message server to the PKI service.
#[derive(Debug, Deserialize, Clone)]
pub struct PkiLinkConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_pki_port")]
    pub port: u16,
    #[serde(default = "default_pki_timeout")]
    pub timeout_secs: u64,
}

impl Default for PkiLinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: None,
            port: default_pki_port(),
            timeout_secs: default_pki_timeout(),
        }
    }
}

fn default_pki_port() -> u16 {
    4443
}

fn default_pki_timeout() -> u64 {
    5
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_buffer_size_mb() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_signature_algorithm() -> String {
    "SHA256withRSA".to_string()
}

fn default_dh_key_size() -> u32 {
    2048
}

fn default_sea_specs() -> Vec<String> {
    vec![
        "AES/CBC/PKCS5".to_string(),
        "AES/ECB/PKCS5".to_string(),
        "AES/CTR/NoPadding".to_string(),
    ]
}

fn default_mac_specs() -> Vec<String> {
    vec!["HmacSHA256".to_string(), "HmacSHA512".to_string()]
}

fn default_validity_days() -> u32 {
    365
}

fn default_server_port() -> u16 {
    5443
}

/// PKI service configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct PkiConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_pki_port")]
    pub port: u16,
    pub threads: usize,
    /// CA key and certificate; also the TLS identity of the service.
    pub keystore: KeystoreConfig,
    /// Only consulted when `tls.mutual_auth` is set.
    #[serde(default)]
    pub truststore: Option<KeystoreConfig>,
    pub database: PathBuf,
    #[serde(default = "pki_tls_default")]
    pub tls: TlsConfig,
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
    #[serde(default = "default_validity_days")]
    pub certificate_validity_days: u32,
}

fn pki_tls_default() -> TlsConfig {
    TlsConfig {
        mutual_auth: false,
        ..TlsConfig::default()
    }
}

/// Message exchange server configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    pub threads: usize,
    pub keystore: KeystoreConfig,
    pub truststore: KeystoreConfig,
    pub database: PathBuf,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub pki: PkiLinkConfig,
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
    #[serde(default = "default_dh_key_size")]
    pub dh_key_size: u32,
    #[serde(default = "default_sea_specs")]
    pub sea_specs: Vec<String>,
    #[serde(default = "default_mac_specs")]
    pub mac_specs: Vec<String>,
}

/// Client library configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub server_address: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    pub pki_address: String,
    #[serde(default = "default_pki_port")]
    pub pki_port: u16,
    pub keystore: KeystoreConfig,
    pub truststore: KeystoreConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default = "default_client_sea_spec")]
    pub sea_spec: String,
    #[serde(default = "default_client_mac_spec")]
    pub mac_spec: String,
    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,
    #[serde(default = "default_output_folder")]
    pub output_folder: PathBuf,
    #[serde(default = "default_buffer_size_mb")]
    pub buffer_size_mb: u64,
    #[serde(default = "default_read_timeout")]
    pub timeout_secs: u64,
}

fn default_client_sea_spec() -> String {
    "AES/CBC/PKCS5".to_string()
}

fn default_client_mac_spec() -> String {
    "HmacSHA256".to_string()
}

fn default_output_folder() -> PathBuf {
    PathBuf::from("received")
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let config_str = fs::read_to_string(path)
        .context(format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&config_str).context(format!("Failed to parse config file: {}", path.display()))
}

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidConfiguration(message.into())
}

/// `0 < threads < available CPUs`.
pub fn validate_threads(threads: usize) -> Result<(), ServiceError> {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if threads == 0 || threads >= cpus {
        return Err(invalid(format!(
            "threads must be between 1 and {} (available CPUs minus one), got {}",
            cpus.saturating_sub(1),
            threads
        )));
    }
    Ok(())
}

fn validate_tls(tls: &TlsConfig) -> Result<(), ServiceError> {
    if tls.protocols.is_empty() {
        return Err(invalid("tls.protocols must not be empty"));
    }
    if let Some(unknown) = tls
        .protocols
        .iter()
        .find(|p| !SUPPORTED_PROTOCOLS.contains(&p.as_str()))
    {
        return Err(invalid(format!(
            "Unsupported TLS protocol '{}'; expected one of {:?}",
            unknown, SUPPORTED_PROTOCOLS
        )));
    }
    Ok(())
}

fn validate_buffer(buffer_size_mb: u64) -> Result<(), ServiceError> {
    if buffer_size_mb == 0 {
        return Err(invalid("buffer_size_mb must be greater than zero"));
    }
    Ok(())
}

fn validate_signature_algorithm(name: &str) -> Result<(), ServiceError> {
    name.parse::<crate::crypto::SignatureAlgorithm>()
        .map(|_| ())
        .map_err(|e| invalid(format!("signature_algorithm: {}", e)))
}

impl PkiConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        read_toml(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_threads(self.threads)?;
        validate_tls(&self.tls)?;
        validate_buffer(self.buffer_size_mb)?;
        validate_signature_algorithm(&self.signature_algorithm)?;
        if self.tls.mutual_auth && self.truststore.is_none() {
            return Err(invalid("tls.mutual_auth requires a truststore"));
        }
        if self.certificate_validity_days == 0 {
            return Err(invalid("certificate_validity_days must be greater than zero"));
        }
        Ok(())
    }

    pub fn max_request_bytes(&self) -> u64 {
        self.buffer_size_mb.saturating_mul(1024 * 1024)
    }
}

impl ServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        read_toml(path.as_ref())
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        validate_threads(self.threads)?;
        validate_tls(&self.tls)?;
        validate_buffer(self.buffer_size_mb)?;
        validate_signature_algorithm(&self.signature_algorithm)?;
        if !self.tls.mutual_auth {
            return Err(invalid("The message server requires tls.mutual_auth = true"));
        }
        if self.pki.enabled && self.pki.address.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("pki.address is required when pki.enabled is set"));
        }
        if self.sea_specs.is_empty() || self.mac_specs.is_empty() {
            return Err(invalid("sea_specs and mac_specs must not be empty"));
        }
        for spec in &self.sea_specs {
            spec.parse::<crate::crypto::SeaSpec>()
                .map_err(|e| invalid(format!("sea_specs: {}", e)))?;
        }
        for spec in &self.mac_specs {
            spec.parse::<crate::crypto::MacAlgorithm>()
                .map_err(|e| invalid(format!("mac_specs: {}", e)))?;
        }
        if self.dh_key_size < 512 {
            return Err(invalid("dh_key_size must be at least 512 bits"));
        }
        Ok(())
    }

    pub fn max_request_bytes(&self) -> u64 {
        self.buffer_size_mb.saturating_mul(1024 * 1024)
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        read_toml(path.as_ref())
    }

    pub fn max_response_bytes(&self) -> u64 {
        self.buffer_size_mb.saturating_mul(1024 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SERVER_TOML: &str = r#"
        port = 6000
        threads = 1
        database = "mailbox.db"

        [keystore]
        location = "server.p12"
        password = "changeit"

        [truststore]
        location = "ca.pem"
        type = "PEM"

        [pki]
        enabled = true
        address = "pki.local"
    "#;

    #[test]
    fn test_server_config_defaults() {
        let config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        assert_eq!(config.port, 6000);
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.keystore.store_type, StoreType::Pkcs12);
        assert_eq!(config.truststore.store_type, StoreType::Pem);
        assert_eq!(
            config.keystore.password.as_ref().unwrap().expose_secret(),
            "changeit"
        );
        assert!(config.tls.mutual_auth);
        assert_eq!(config.tls.protocols, vec!["TLSv1.2", "TLSv1.3"]);
        assert_eq!(config.pki.port, 4443);
        assert_eq!(config.buffer_size_mb, 10);
        assert_eq!(config.max_request_bytes(), 10 * 1024 * 1024);
        assert_eq!(config.sea_specs[0], "AES/CBC/PKCS5");
        assert!(!config.debug);
    }

    #[test]
    fn test_password_is_redacted_in_debug() {
        let config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        assert!(!format!("{:?}", config).contains("changeit"));
    }

    #[test]
    fn test_thread_bounds() {
        assert!(validate_threads(0).is_err());
        assert!(validate_threads(usize::MAX).is_err());
    }

    #[test]
    fn test_server_validation_rules() {
        let mut config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        config.threads = 0;
        assert!(matches!(
            config.validate(),
            Err(ServiceError::InvalidConfiguration(_))
        ));

        let mut config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        config.pki.address = None;
        assert!(validate_without_threads(&config).is_err());

        let mut config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        config.tls.protocols = vec!["SSLv3".to_string()];
        assert!(validate_tls(&config.tls).is_err());

        let mut config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        config.sea_specs = vec!["AES/XTS/PKCS5".to_string()];
        assert!(validate_without_threads(&config).is_err());

        let mut config: ServerConfig = toml::from_str(SERVER_TOML).unwrap();
        config.buffer_size_mb = 0;
        assert!(validate_buffer(config.buffer_size_mb).is_err());
    }

    fn validate_without_threads(config: &ServerConfig) -> Result<(), ServiceError> {
        let mut config = config.clone();
        config.threads = 1;
        config.validate()
    }

    #[test]
    fn test_pki_config_defaults() {
        let config: PkiConfig = toml::from_str(
            r#"
            threads = 1
            database = "pki.db"
            certificate_validity_days = 30

            [keystore]
            location = "ca.pem"
            type = "PEM"
            "#,
        )
        .unwrap();
        assert!(!config.tls.mutual_auth);
        assert!(config.truststore.is_none());
        assert_eq!(config.port, 4443);
        assert_eq!(config.signature_algorithm, "SHA256withRSA");
        assert_eq!(config.certificate_validity_days, 30);
    }

    #[test]
    fn test_from_file_reports_path() {
        let err = ServerConfig::from_file("/nonexistent/server.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/server.toml"));
    }
}
