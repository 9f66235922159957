//! TLS acceptor and connector construction from configuration.

use openssl::ssl::{
    SslAcceptor, SslConnector, SslContextBuilder, SslMethod, SslOptions, SslVerifyMode,
};

use crate::configs::TlsConfig;
use crate::error::ServiceError;
use crate::keystore::{KeyStore, TrustStore};

fn tls_error(what: &str) -> impl Fn(openssl::error::ErrorStack) -> ServiceError + '_ {
    move |e| ServiceError::InvalidConfiguration(format!("{}: {}", what, e))
}

fn is_tls13_suite(name: &str) -> bool {
    name.starts_with("TLS_AES_") || name.starts_with("TLS_CHACHA20_")
}

/// Apply the protocol and cipher-suite lists to a context.
fn apply_policy(builder: &mut SslContextBuilder, tls: &TlsConfig) -> Result<(), ServiceError> {
    let mut options = SslOptions::empty();
    if !tls.protocols.iter().any(|p| p == "TLSv1.2") {
        options |= SslOptions::NO_TLSV1_2;
    }
    if !tls.protocols.iter().any(|p| p == "TLSv1.3") {
        options |= SslOptions::NO_TLSV1_3;
    }
    builder.set_options(SslOptions::NO_TLSV1 | SslOptions::NO_TLSV1_1 | options);

    let (tls13, tls12): (Vec<&str>, Vec<&str>) = tls
        .cipher_suites
        .iter()
        .map(String::as_str)
        .partition(|name| is_tls13_suite(name));
    if !tls13.is_empty() {
        builder
            .set_ciphersuites(&tls13.join(":"))
            .map_err(tls_error("Invalid TLS 1.3 cipher suites"))?;
    }
    if !tls12.is_empty() {
        builder
            .set_cipher_list(&tls12.join(":"))
            .map_err(tls_error("Invalid TLS 1.2 cipher list"))?;
    }
    Ok(())
}

fn install_identity(builder: &mut SslContextBuilder, keystore: &KeyStore) -> Result<(), ServiceError> {
    let key = keystore.private_key()?;
    builder
        .set_private_key(&key)
        .map_err(tls_error("Failed to install private key"))?;
    builder
        .set_certificate(keystore.certificate())
        .map_err(tls_error("Failed to install certificate"))?;
    for cert in keystore.chain().iter().skip(1) {
        builder
            .add_extra_chain_cert(cert.clone())
            .map_err(tls_error("Failed to install chain certificate"))?;
    }
    builder
        .check_private_key()
        .map_err(tls_error("Private key does not match certificate"))
}

fn install_trust(builder: &mut SslContextBuilder, truststore: &TrustStore) -> Result<(), ServiceError> {
    for anchor in truststore.anchors() {
        builder
            .cert_store_mut()
            .add_cert(anchor.clone())
            .map_err(tls_error("Failed to add trust anchor"))?;
    }
    Ok(())
}

/// Build the listening side.
///
/// With `tls.mutual_auth` set, the handshake fails unless the peer presents a
/// certificate chaining to `truststore`.
pub fn build_acceptor(
    keystore: &KeyStore,
    truststore: Option<&TrustStore>,
    tls: &TlsConfig,
) -> Result<SslAcceptor, ServiceError> {
    let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server())
        .map_err(tls_error("Failed to create TLS acceptor"))?;
    apply_policy(&mut builder, tls)?;
    install_identity(&mut builder, keystore)?;

    if tls.mutual_auth {
        let truststore = truststore.ok_or_else(|| {
            ServiceError::InvalidConfiguration("Mutual TLS requires a truststore".to_string())
        })?;
        install_trust(&mut builder, truststore)?;
        builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    } else {
        builder.set_verify(SslVerifyMode::NONE);
    }
    Ok(builder.build())
}

/// Build the dialling side. A keystore is presented when given.
pub fn build_connector(
    keystore: Option<&KeyStore>,
    truststore: &TrustStore,
    tls: &TlsConfig,
) -> Result<SslConnector, ServiceError> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(tls_error("Failed to create TLS connector"))?;
    apply_policy(&mut builder, tls)?;
    install_trust(&mut builder, truststore)?;
    if let Some(keystore) = keystore {
        install_identity(&mut builder, keystore)?;
    }
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}
