//! Revocation cross-check against the PKI service.

use std::time::Duration;

use tracing::{debug, warn};

use crate::client::pki::{PkiClient, RevocationStatus};
use crate::client::ClientError;
use crate::configs::{PkiLinkConfig, TlsConfig};
use crate::error::ServiceError;
use crate::keystore::TrustStore;
use crate::tls;

/// Asks the PKI service about every peer serial. Answers are never cached.
pub struct PkiLink {
    client: PkiClient,
}

impl PkiLink {
    pub fn new(client: PkiClient) -> Self {
        Self { client }
    }

    /// `None` when the linkage is disabled.
    pub fn from_config(
        link: &PkiLinkConfig,
        truststore: &TrustStore,
        tls_config: &TlsConfig,
    ) -> Result<Option<Self>, ServiceError> {
        if !link.enabled {
            return Ok(None);
        }
        let address = link.address.clone().ok_or_else(|| {
            ServiceError::InvalidConfiguration("pki.address is required".to_string())
        })?;
        let connector = tls::build_connector(None, truststore, tls_config)?;
        let client = PkiClient::new(connector, address, link.port)
            .verify_hostname(tls_config.verify_hostname)
            .timeout(Duration::from_secs(link.timeout_secs));
        Ok(Some(Self::new(client)))
    }

    pub fn ensure_not_revoked(&self, serial: u64) -> Result<(), ServiceError> {
        match self.client.check_revocation(serial) {
            Ok(RevocationStatus::Valid) => Ok(()),
            Ok(RevocationStatus::Revoked { .. }) => {
                debug!("Rejected revoked certificate {}", serial);
                Err(ServiceError::AuthorisationFailed(
                    "Certificate has been revoked.".to_string(),
                ))
            }
            Err(ClientError::Rejected { code: 404, .. }) => Err(
                ServiceError::AuthorisationFailed("Certificate is unknown to the PKI.".to_string()),
            ),
            Err(e) => {
                warn!("PKI revocation check for {} failed: {}", serial, e);
                Err(ServiceError::UpstreamUnavailable(
                    "PKI service unavailable.".to_string(),
                ))
            }
        }
    }
}
