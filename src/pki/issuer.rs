//! User Certificate Issuance Module
//!
//! Turns a verified PKCS#10 request into an end-entity certificate signed by
//! the CA key.
//!
//! # Certificate Properties
//! - **Subject / public key**: copied from the CSR
//! - **Issuer**: the CA subject
//! - **Serial Number**: allocated by the PKI store's monotonic counter
//! - **Basic Constraints**: CA=false, critical
//! - **Key Usage**: digitalSignature, nonRepudiation, keyEncipherment
//! - **Extended Key Usage**: clientAuth, serverAuth
//!
//! # Example
//! ```rust,no_run
//! # use openssl::pkey::{PKey, Private};
//! # use openssl::x509::{X509, X509Req};
//! use pki_mailbox::pki::issuer::UserCertificateBuilder;
//! # fn example(ca_key: PKey<Private>, ca_cert: X509, csr: X509Req) -> Result<(), pki_mailbox::crypto::CryptoError> {
//! let certificate = UserCertificateBuilder::new(&ca_key, &ca_cert)
//!     .serial(42)
//!     .validity_days(365)
//!     .build(&csr)?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Ref, X509Req, X509};

use crate::crypto::{CryptoError, SignatureAlgorithm};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Parse a DER PKCS#10 request and check its self-signature.
pub fn parse_csr(der: &[u8]) -> Result<X509Req, CryptoError> {
    let req = X509Req::from_der(der)
        .map_err(|e| CryptoError::BadInput(format!("Malformed CSR: {}", e)))?;
    let public_key = req
        .public_key()
        .map_err(|e| CryptoError::BadKey(format!("CSR public key unreadable: {}", e)))?;
    let valid = req.verify(&public_key).unwrap_or(false);
    if !valid {
        return Err(CryptoError::BadSignature(
            "CSR signature does not match its public key".to_string(),
        ));
    }
    Ok(req)
}

/// One-line `/CN=.../O=...` rendering of a subject for the issued table.
///
/// A subject entry that cannot be decoded to UTF-8 fails the request.
pub fn subject_line(req: &X509Req) -> Result<String, CryptoError> {
    let mut line = String::new();
    for entry in req.subject_name().entries() {
        let key = entry.object().nid().short_name().unwrap_or("?");
        let value = entry.data().as_utf8().map_err(|e| {
            CryptoError::BadInput(format!("Undecodable subject entry {}: {}", key, e))
        })?;
        line.push_str(&format!("/{}={}", key, value));
    }
    Ok(line)
}

fn crypto_err(what: &'static str) -> impl Fn(openssl::error::ErrorStack) -> CryptoError {
    move |e| CryptoError::CryptoUnavailable(format!("{}: {}", what, e))
}

/// Builder for end-entity certificates issued from a CSR.
pub struct UserCertificateBuilder<'a> {
    ca_key: &'a PKeyRef<Private>,
    ca_cert: &'a X509Ref,
    serial: u64,
    validity_days: u32,
    signature_algorithm: SignatureAlgorithm,
    not_before: DateTime<Utc>,
}

impl<'a> UserCertificateBuilder<'a> {
    /// # Arguments
    /// * `ca_key` - CA private key used to sign
    /// * `ca_cert` - CA certificate (issuer information)
    pub fn new(ca_key: &'a PKeyRef<Private>, ca_cert: &'a X509Ref) -> Self {
        Self {
            ca_key,
            ca_cert,
            serial: 0,
            validity_days: 365,
            signature_algorithm: SignatureAlgorithm::default(),
            not_before: Utc::now(),
        }
    }

    pub fn serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = algorithm;
        self
    }

    /// End of the validity window the certificate will carry.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_before + Duration::days(i64::from(self.validity_days))
    }

    /// Sign a certificate for an already verified request.
    pub fn build(self, csr: &X509Req) -> Result<X509, CryptoError> {
        if self.serial == 0 {
            return Err(CryptoError::BadInput("Serial number not set".to_string()));
        }
        let public_key = csr
            .public_key()
            .map_err(|e| CryptoError::BadKey(format!("CSR public key unreadable: {}", e)))?;

        let mut builder = X509::builder().map_err(crypto_err("Failed to create X509 builder"))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(crypto_err("Failed to set version"))?;

        let serial = BigNum::from_dec_str(&self.serial.to_string())
            .and_then(|bn| bn.to_asn1_integer())
            .map_err(crypto_err("Failed to encode serial"))?;
        builder
            .set_serial_number(&serial)
            .map_err(crypto_err("Failed to set serial"))?;

        builder
            .set_subject_name(csr.subject_name())
            .map_err(crypto_err("Failed to set subject"))?;
        builder
            .set_issuer_name(self.ca_cert.subject_name())
            .map_err(crypto_err("Failed to set issuer from CA"))?;
        builder
            .set_pubkey(&public_key)
            .map_err(crypto_err("Failed to set public key"))?;

        let not_before = Asn1Time::from_unix(self.not_before.timestamp() as _)
            .map_err(crypto_err("Failed to create not_before"))?;
        builder
            .set_not_before(&not_before)
            .map_err(crypto_err("Failed to set not_before"))?;
        let not_after = Asn1Time::from_unix(self.not_after().timestamp() as _)
            .map_err(crypto_err("Failed to create not_after"))?;
        builder
            .set_not_after(&not_after)
            .map_err(crypto_err("Failed to set not_after"))?;

        // End-entity: no .ca() call
        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(crypto_err("Failed to build BasicConstraints"))?;
        builder
            .append_extension(bc)
            .map_err(crypto_err("Failed to add BasicConstraints"))?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .non_repudiation()
            .key_encipherment()
            .build()
            .map_err(crypto_err("Failed to build KeyUsage"))?;
        builder
            .append_extension(ku)
            .map_err(crypto_err("Failed to add KeyUsage"))?;

        let eku = ExtendedKeyUsage::new()
            .client_auth()
            .server_auth()
            .build()
            .map_err(crypto_err("Failed to build ExtendedKeyUsage"))?;
        builder
            .append_extension(eku)
            .map_err(crypto_err("Failed to add ExtendedKeyUsage"))?;

        builder
            .sign(self.ca_key, self.signature_algorithm.digest().message_digest())
            .map_err(crypto_err("Failed to sign certificate"))?;
        Ok(builder.build())
    }

    /// RFC 3339 form of [`UserCertificateBuilder::not_after`], as stored.
    pub fn not_after_string(&self) -> String {
        self.not_after().to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::csr::CsrBuilder;
    use crate::crypto::certificate::test_support::{rsa_key, self_signed};
    use crate::crypto::{extract_serial, verify_chain};
    use openssl::nid::Nid;

    #[test]
    fn test_issue_from_csr() {
        let ca_key = rsa_key();
        let ca_cert = self_signed("Issuer CA", &ca_key);
        let user_key = rsa_key();
        let csr_der = CsrBuilder::new(&user_key)
            .subject_common_name("alice".to_string())
            .organization("Example".to_string())
            .build_der()
            .unwrap();

        let csr = parse_csr(&csr_der).unwrap();
        assert_eq!(subject_line(&csr).unwrap(), "/CN=alice/O=Example");

        let cert = UserCertificateBuilder::new(&ca_key, &ca_cert)
            .serial(7)
            .validity_days(30)
            .build(&csr)
            .unwrap();

        assert_eq!(extract_serial(&cert).unwrap(), 7);
        assert!(verify_chain(&[cert.clone()], &[ca_cert.clone()]).is_ok());
        assert_eq!(
            cert.public_key().unwrap().public_key_to_der().unwrap(),
            user_key.public_key_to_der().unwrap()
        );
        let issuer_cn = cert
            .issuer_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(issuer_cn, "Issuer CA");
    }

    #[test]
    fn test_tampered_csr_rejected() {
        let user_key = rsa_key();
        let mut der = CsrBuilder::new(&user_key)
            .subject_common_name("mallory".to_string())
            .build_der()
            .unwrap();
        let last = der.len() - 1;
        der[last] ^= 0x01;
        assert!(matches!(
            parse_csr(&der),
            Err(CryptoError::BadSignature(_))
        ));
        assert!(matches!(
            parse_csr(b"not a csr"),
            Err(CryptoError::BadInput(_))
        ));
    }

    #[test]
    fn test_undecodable_subject_entry_rejected() {
        use openssl::asn1::Asn1Type;
        use openssl::hash::MessageDigest;
        use openssl::x509::{X509NameBuilder, X509ReqBuilder};

        let key = rsa_key();
        let mut name = X509NameBuilder::new().unwrap();
        // BMPString content must be whole UTF-16 code units.
        name.append_entry_by_nid_with_type(Nid::COMMONNAME, "odd", Asn1Type::BMPSTRING)
            .unwrap();
        let name = name.build();
        let mut builder = X509ReqBuilder::new().unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let csr = builder.build();

        assert!(matches!(subject_line(&csr), Err(CryptoError::BadInput(_))));
    }

    #[test]
    fn test_serial_required() {
        let ca_key = rsa_key();
        let ca_cert = self_signed("Issuer CA", &ca_key);
        let csr = parse_csr(
            &CsrBuilder::new(&ca_key)
                .subject_common_name("x".to_string())
                .build_der()
                .unwrap(),
        )
        .unwrap();
        assert!(UserCertificateBuilder::new(&ca_key, &ca_cert)
            .build(&csr)
            .is_err());
    }
}
