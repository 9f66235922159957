//! X.509 parsing and chain validation.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::Asn1Time;
use openssl::pkey::{PKey, Public};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Ref, X509StoreContext, X509};

use super::{CryptoError, Result};

/// Parse a PEM bundle (leaf first) or a single DER certificate.
pub fn parse_chain(bytes: &[u8]) -> Result<Vec<X509>> {
    if bytes.starts_with(b"-----BEGIN") {
        let chain = X509::stack_from_pem(bytes)
            .map_err(|e| CryptoError::BadInput(format!("Invalid PEM certificate chain: {}", e)))?;
        if chain.is_empty() {
            return Err(CryptoError::BadInput("Empty certificate chain".to_string()));
        }
        Ok(chain)
    } else {
        let cert = X509::from_der(bytes)
            .map_err(|e| CryptoError::BadInput(format!("Invalid DER certificate: {}", e)))?;
        Ok(vec![cert])
    }
}

/// Verify that `chain[0]` chains up to one of `trust_anchors`, using the
/// remaining chain entries as intermediates.
pub fn verify_chain(chain: &[X509], trust_anchors: &[X509]) -> Result<()> {
    let (leaf, intermediates) = chain
        .split_first()
        .ok_or_else(|| CryptoError::BadInput("Empty certificate chain".to_string()))?;

    let unavailable = |e: openssl::error::ErrorStack| CryptoError::CryptoUnavailable(e.to_string());

    let mut store = X509StoreBuilder::new().map_err(unavailable)?;
    for anchor in trust_anchors {
        store.add_cert(anchor.clone()).map_err(unavailable)?;
    }
    let store = store.build();

    let mut untrusted = Stack::new().map_err(unavailable)?;
    for cert in intermediates {
        untrusted.push(cert.clone()).map_err(unavailable)?;
    }

    let mut ctx = X509StoreContext::new().map_err(unavailable)?;
    let verified = ctx
        .init(&store, leaf, &untrusted, |c| {
            let ok = c.verify_cert()?;
            if !ok {
                tracing::debug!("Chain validation failed: {}", c.error());
            }
            Ok(ok)
        })
        .map_err(unavailable)?;

    if verified {
        Ok(())
    } else {
        Err(CryptoError::BadSignature(
            "Certificate chain does not verify".to_string(),
        ))
    }
}

pub fn extract_public_key(cert: &X509Ref) -> Result<PKey<Public>> {
    cert.public_key()
        .map_err(|e| CryptoError::BadKey(format!("Failed to extract public key: {}", e)))
}

/// SubjectPublicKeyInfo DER of the certificate key.
pub fn public_key_der(cert: &X509Ref) -> Result<Vec<u8>> {
    extract_public_key(cert)?
        .public_key_to_der()
        .map_err(|e| CryptoError::BadKey(format!("Failed to encode public key: {}", e)))
}

/// The serial number as an integer. Serials issued by the PKI service are
/// small monotonic integers; anything that does not fit `u64` is rejected.
pub fn extract_serial(cert: &X509Ref) -> Result<u64> {
    let bn = cert
        .serial_number()
        .to_bn()
        .map_err(|e| CryptoError::BadInput(format!("Invalid serial number: {}", e)))?;
    let dec = bn
        .to_dec_str()
        .map_err(|e| CryptoError::BadInput(format!("Invalid serial number: {}", e)))?;
    dec.parse::<u64>()
        .map_err(|_| CryptoError::BadInput(format!("Serial number out of range: {}", &*dec)))
}

/// Whether `time` lies inside the certificate validity window.
pub fn valid_at(cert: &X509Ref, time: SystemTime) -> Result<bool> {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| CryptoError::BadInput("Time before the epoch".to_string()))?
        .as_secs();
    let at = Asn1Time::from_unix(secs as _)
        .map_err(|e| CryptoError::BadInput(format!("{}", e)))?;
    let unavailable = |e: openssl::error::ErrorStack| CryptoError::CryptoUnavailable(e.to_string());
    let after_start = cert.not_before().compare(&at).map_err(unavailable)? != Ordering::Greater;
    let before_end = cert.not_after().compare(&at).map_err(unavailable)? != Ordering::Less;
    Ok(after_start && before_end)
}

/// Common name of the certificate subject, for logging.
pub fn subject_common_name(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
        .and_then(|e| e.data().as_utf8().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_chain_parsing_and_validation() {
        let ca_key = rsa_key();
        let ca = self_signed("Test CA", &ca_key);
        let user_key = rsa_key();
        let user = leaf("alice", 42, &user_key, &ca_key, &ca);

        let mut pem = user.to_pem().unwrap();
        pem.extend(ca.to_pem().unwrap());
        let chain = parse_chain(&pem).unwrap();
        assert_eq!(chain.len(), 2);

        assert!(verify_chain(&chain, std::slice::from_ref(&ca)).is_ok());

        let stranger_key = rsa_key();
        let stranger = self_signed("Other CA", &stranger_key);
        assert!(matches!(
            verify_chain(&chain[..1], &[stranger]),
            Err(CryptoError::BadSignature(_))
        ));
    }

    #[test]
    fn test_serial_key_and_validity() {
        let ca_key = rsa_key();
        let ca = self_signed("Test CA", &ca_key);
        let user_key = rsa_key();
        let user = leaf("bob", 0x2A, &user_key, &ca_key, &ca);

        assert_eq!(extract_serial(&user).unwrap(), 42);
        assert_eq!(
            public_key_der(&user).unwrap(),
            user_key.public_key_to_der().unwrap()
        );
        assert_eq!(subject_common_name(&user), "bob");

        let now = SystemTime::now();
        assert!(valid_at(&user, now).unwrap());
        assert!(!valid_at(&user, now + Duration::from_secs(60 * 60 * 24 * 90)).unwrap());
        assert!(!valid_at(&user, now - Duration::from_secs(60 * 60 * 24 * 2)).unwrap());
    }

    #[test]
    fn test_der_single_certificate() {
        let key = rsa_key();
        let cert = self_signed("Solo", &key);
        let parsed = parse_chain(&cert.to_der().unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert!(parse_chain(b"garbage").is_err());
    }
}
