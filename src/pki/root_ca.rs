//! Root CA Certificate Generation Module
//!
//! Generates the self-signed CA key and certificate that the PKI service signs
//! user certificates with and presents as its own TLS identity.
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key Usage**: keyCertSign, cRLSign, digitalSignature
//! - **Basic Constraints**: CA=true, pathlen=0 (signs end-entity certificates only)
//! - **Default Key Size**: RSA 4096-bit
//! - **Default Validity**: 3650 days
//!
//! # Example
//! ```rust,no_run
//! use pki_mailbox::pki::root_ca::RsaRootCABuilder;
//! # fn example() -> anyhow::Result<()> {
//! let (ca_key, ca_cert) = RsaRootCABuilder::new()
//!     .subject_common_name("Mailbox Root CA".to_string())
//!     .organization("Example Corporation".to_string())
//!     .validity_days(3650)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const RSA_KEY_SIZE_DEFAULT: u32 = 4096;
const ROOT_CA_PATH_LENGTH: u32 = 0;

/// Builder for the CA key pair and its self-signed certificate.
///
/// Only the common name is required; empty distinguished-name fields are
/// left out of the subject.
pub struct RsaRootCABuilder {
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    country: String,
    validity_days: u32,
    key_size: u32,
}

impl Default for RsaRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaRootCABuilder {
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            country: String::new(),
            validity_days: 3650,
            key_size: RSA_KEY_SIZE_DEFAULT,
        }
    }

    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    /// Two-letter ISO 3166-1 country code
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// RSA modulus size in bits (default 4096).
    pub fn key_size(mut self, bits: u32) -> Self {
        self.key_size = bits;
        self
    }

    /// Build the RSA key pair and self-signed CA certificate
    ///
    /// # Returns
    /// * `Ok((PKey<Private>, X509))` - Tuple of (private key, certificate)
    ///
    /// # Errors
    /// Returns error if the common name is empty, key generation fails or the
    /// certificate cannot be assembled and signed.
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        if self.subject_common_name.is_empty() {
            return Err(anyhow!("Root CA common name must not be empty"));
        }

        let rsa = openssl::rsa::Rsa::generate(self.key_size)
            .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
        let private_key =
            PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))?;

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;
        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        // Random 128-bit serial; user serials come from the PKI counter instead.
        let mut serial = BigNum::new()?;
        serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
        let asn1_serial = serial.to_asn1_integer()?;
        builder.set_serial_number(&asn1_serial)?;

        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        let entries = [
            (Nid::COMMONNAME, &self.subject_common_name, "CN"),
            (Nid::ORGANIZATIONNAME, &self.organization, "organization"),
            (
                Nid::ORGANIZATIONALUNITNAME,
                &self.organizational_unit,
                "organizational unit",
            ),
            (Nid::COUNTRYNAME, &self.country, "country"),
        ];
        for (nid, value, label) in entries {
            if !value.is_empty() {
                name_builder
                    .append_entry_by_nid(nid, value)
                    .map_err(|e| anyhow!("Failed to set {}: {}", label, e))?;
            }
        }
        let name = name_builder.build();

        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(&name)
            .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

        let not_before = openssl::asn1::Asn1Time::days_from_now(0)
            .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
        let not_after = openssl::asn1::Asn1Time::days_from_now(self.validity_days)
            .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca().pathlen(ROOT_CA_PATH_LENGTH);
        let extension = bc
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(extension)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.key_cert_sign();
        ku.crl_sign();
        ku.digital_signature();
        let ku_extension = ku
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;
        Ok((private_key, builder.build()))
    }
}
