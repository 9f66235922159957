//! Client side of the PKI service.

use std::time::Duration;

use openssl::ssl::SslConnector;
use openssl::x509::X509;
use tracing::debug;

use crate::configs::ClientConfig;
use crate::crypto::{encoding, parse_chain};
use crate::keystore::TrustStore;
use crate::protocol::{PkiRequest, Response};
use crate::tls;
use crate::transport::exchange;

use super::{encode_request, ClientError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_RESPONSE: u64 = 10 * 1024 * 1024;

/// Answer of a revocation check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationStatus {
    Valid,
    Revoked { at: Option<String> },
}

impl RevocationStatus {
    pub fn is_revoked(&self) -> bool {
        matches!(self, RevocationStatus::Revoked { .. })
    }
}

/// Unilateral-TLS client for `sign` and `check`.
///
/// Every call opens its own connection; nothing is cached between calls.
pub struct PkiClient {
    connector: SslConnector,
    host: String,
    port: u16,
    verify_hostname: bool,
    timeout: Duration,
    max_response_bytes: u64,
}

impl PkiClient {
    pub fn new(connector: SslConnector, host: impl Into<String>, port: u16) -> Self {
        Self {
            connector,
            host: host.into(),
            port,
            verify_hostname: false,
            timeout: DEFAULT_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let truststore = TrustStore::load(&config.truststore)?;
        let connector = tls::build_connector(None, &truststore, &config.tls)?;
        Ok(Self::new(connector, config.pki_address.clone(), config.pki_port)
            .verify_hostname(config.tls.verify_hostname)
            .timeout(Duration::from_secs(config.timeout_secs))
            .max_response_bytes(config.max_response_bytes()))
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn verify_hostname(mut self, verify: bool) -> Self {
        self.verify_hostname = verify;
        self
    }

    pub fn max_response_bytes(mut self, limit: u64) -> Self {
        self.max_response_bytes = limit;
        self
    }

    fn call(&self, request: &PkiRequest) -> Result<Response> {
        let bytes = encode_request(request, None)?;
        let response = exchange(
            &self.connector,
            &self.host,
            self.port,
            self.verify_hostname,
            self.timeout,
            &bytes,
            self.max_response_bytes,
        )?;
        if !response.is_success() {
            return Err(ClientError::Rejected {
                code: response.status.code,
                message: response.error.unwrap_or(response.status.message),
            });
        }
        Ok(response)
    }

    /// Submit a DER CSR and return the issued chain, leaf first.
    pub fn request_certificate(&self, csr_der: &[u8]) -> Result<Vec<X509>> {
        let response = self.call(&PkiRequest::Sign {
            csr: encoding::encode(csr_der),
        })?;
        let pem = encoding::decode(&response.get::<String>("certificate")?)?;
        let chain = parse_chain(&pem)?;
        debug!("Received certificate chain of {} entries", chain.len());
        Ok(chain)
    }

    pub fn check_revocation(&self, serial: u64) -> Result<RevocationStatus> {
        let response = self.call(&PkiRequest::Check { serial })?;
        if response.get::<bool>("revoked")? {
            Ok(RevocationStatus::Revoked {
                at: response.get::<String>("revokedAt").ok(),
            })
        } else {
            Ok(RevocationStatus::Valid)
        }
    }
}
