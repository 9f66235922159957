//! The PKI request handler and service bootstrap.

use std::sync::Arc;
use std::time::Duration;

use openssl::x509::{X509Ref, X509};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::configs::PkiConfig;
use crate::crypto::{encoding, extract_serial, SignatureAlgorithm};
use crate::error::ServiceError;
use crate::keystore::{KeyStore, TrustStore};
use crate::protocol::{parse_request, Payload, PkiRequest, Response};
use crate::tls;
use crate::transport::{ConnectionSettings, RequestHandler, Server};

use super::issuer::{parse_csr, subject_line, UserCertificateBuilder};
use super::store::{PkiStore, RevocationState};

/// Largest CSR accepted, in DER bytes.
const MAX_CSR_BYTES: usize = 64 * 1024;

/// Signs CSRs and answers revocation checks.
pub struct PkiService {
    keystore: KeyStore,
    store: Arc<PkiStore>,
    validity_days: u32,
    signature_algorithm: SignatureAlgorithm,
}

impl PkiService {
    pub fn new(
        keystore: KeyStore,
        store: Arc<PkiStore>,
        validity_days: u32,
        signature_algorithm: SignatureAlgorithm,
    ) -> Self {
        Self {
            keystore,
            store,
            validity_days,
            signature_algorithm,
        }
    }

    pub fn from_config(config: &PkiConfig) -> Result<Self, ServiceError> {
        let keystore = KeyStore::load(&config.keystore)?;
        let store = PkiStore::open(&config.database)?;
        let signature_algorithm = config
            .signature_algorithm
            .parse()
            .map_err(|e| ServiceError::InvalidConfiguration(format!("{}", e)))?;
        Ok(Self::new(
            keystore,
            Arc::new(store),
            config.certificate_validity_days,
            signature_algorithm,
        ))
    }

    pub fn store(&self) -> &Arc<PkiStore> {
        &self.store
    }

    /// Issue a certificate and return the PEM chain (leaf, then CA chain).
    pub fn sign(&self, csr_b64: &str) -> Result<Vec<X509>, ServiceError> {
        let der = encoding::decode_bounded(csr_b64, MAX_CSR_BYTES)?;
        let csr = parse_csr(&der)?;
        let subject = subject_line(&csr)?;

        let serial = self.store.next_serial()?;
        let ca_key = self.keystore.private_key()?;
        let builder = UserCertificateBuilder::new(&ca_key, self.keystore.certificate())
            .serial(serial)
            .validity_days(self.validity_days)
            .signature_algorithm(self.signature_algorithm);
        let not_after = builder.not_after_string();
        let certificate = builder.build(&csr)?;

        self.store.record_issued(serial, &subject, &not_after)?;
        info!("Issued certificate serial {} for {}", serial, subject);

        let mut chain = vec![certificate];
        chain.extend(self.keystore.chain().iter().cloned());
        Ok(chain)
    }

    pub fn check(&self, serial: u64) -> Result<RevocationState, ServiceError> {
        Ok(self.store.revocation_state(serial)?)
    }
}

fn chain_to_pem(chain: &[X509]) -> Result<Vec<u8>, ServiceError> {
    let mut pem = Vec::new();
    for cert in chain {
        let encoded = cert.to_pem().map_err(|e| {
            ServiceError::Crypto(crate::crypto::CryptoError::CryptoUnavailable(e.to_string()))
        })?;
        pem.extend(encoded);
    }
    Ok(pem)
}

impl RequestHandler for PkiService {
    /// Serial of the client certificate, when one was presented.
    type Peer = Option<u64>;

    fn authenticate(&self, peer: Option<&X509Ref>) -> Result<Option<u64>, ServiceError> {
        Ok(peer.and_then(|cert| extract_serial(cert).ok()))
    }

    fn handle(&self, peer: &Option<u64>, request: Value) -> Result<Response, ServiceError> {
        let envelope = parse_request::<PkiRequest>(request)?;
        debug!(
            "Request: {} made by {}",
            match envelope.request {
                PkiRequest::Sign { .. } => "sign",
                PkiRequest::Check { .. } => "check",
            },
            peer.map(|s| s.to_string())
                .unwrap_or_else(|| "anonymous".to_string())
        );

        let mut payload = Payload::new();
        match envelope.request {
            PkiRequest::Sign { csr } => {
                let chain = self.sign(&csr)?;
                payload.insert(
                    "certificate".to_string(),
                    json!(encoding::encode(&chain_to_pem(&chain)?)),
                );
            }
            PkiRequest::Check { serial } => match self.check(serial)? {
                RevocationState::Issued => {
                    payload.insert("revoked".to_string(), json!(false));
                }
                RevocationState::Revoked { at } => {
                    payload.insert("revoked".to_string(), json!(true));
                    payload.insert("revokedAt".to_string(), json!(at));
                }
            },
        }
        Ok(Response::success(envelope.nonce, payload))
    }
}

/// Validate the configuration, bind the listener and build the service.
pub fn bind(config: &PkiConfig) -> Result<Server<PkiService>, ServiceError> {
    let service = PkiService::from_config(config)?;
    let truststore = config
        .truststore
        .as_ref()
        .filter(|_| config.tls.mutual_auth)
        .map(TrustStore::load)
        .transpose()?;
    let acceptor = tls::build_acceptor(&service.keystore, truststore.as_ref(), &config.tls)?;
    let settings = ConnectionSettings {
        read_timeout: Duration::from_secs(config.read_timeout_secs),
        max_request_bytes: config.max_request_bytes(),
        debug: config.debug,
    };
    Server::bind(
        "pki",
        (config.bind_address.as_str(), config.port),
        acceptor,
        service,
        config.threads,
        settings,
    )
}

/// Run the PKI service until the process is stopped.
pub fn run(config: &PkiConfig) -> Result<(), ServiceError> {
    config.validate()?;
    let server = bind(config)?;
    server.serve()
}
