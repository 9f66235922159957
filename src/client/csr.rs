//! PKCS#10 certificate signing requests.

use openssl::nid::Nid;
use openssl::pkey::{PKeyRef, Private};
use openssl::x509::{X509NameBuilder, X509Req, X509ReqBuilder};

use crate::crypto::{CryptoError, SignatureAlgorithm};

fn crypto_err(what: &'static str) -> impl Fn(openssl::error::ErrorStack) -> CryptoError {
    move |e| CryptoError::CryptoUnavailable(format!("{}: {}", what, e))
}

/// Builder for a CSR signed with the requester's long-term key.
///
/// Only the common name is required; empty fields are left out of the subject.
///
/// # Example
/// ```rust,no_run
/// # use openssl::pkey::{PKey, Private};
/// use pki_mailbox::client::csr::CsrBuilder;
/// # fn example(key: PKey<Private>) -> Result<(), pki_mailbox::crypto::CryptoError> {
/// let der = CsrBuilder::new(&key)
///     .subject_common_name("alice@example.com".to_string())
///     .organization("Example Corp".to_string())
///     .country("US".to_string())
///     .build_der()?;
/// # Ok(())
/// # }
/// ```
pub struct CsrBuilder<'a> {
    key: &'a PKeyRef<Private>,
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    signature_algorithm: SignatureAlgorithm,
}

impl<'a> CsrBuilder<'a> {
    pub fn new(key: &'a PKeyRef<Private>) -> Self {
        Self {
            key,
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            signature_algorithm: SignatureAlgorithm::default(),
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

    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    /// Two-letter ISO 3166-1 country code
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn signature_algorithm(mut self, algorithm: SignatureAlgorithm) -> Self {
        self.signature_algorithm = algorithm;
        self
    }

    pub fn build(self) -> Result<X509Req, CryptoError> {
        if self.subject_common_name.is_empty() {
            return Err(CryptoError::BadInput(
                "CSR common name must not be empty".to_string(),
            ));
        }

        let mut name = X509NameBuilder::new().map_err(crypto_err("Failed to create name builder"))?;
        let entries = [
            (Nid::COMMONNAME, &self.subject_common_name),
            (Nid::ORGANIZATIONNAME, &self.organization),
            (Nid::ORGANIZATIONALUNITNAME, &self.organizational_unit),
            (Nid::LOCALITYNAME, &self.locality),
            (Nid::STATEORPROVINCENAME, &self.state),
            (Nid::COUNTRYNAME, &self.country),
        ];
        for (nid, value) in entries {
            if !value.is_empty() {
                name.append_entry_by_nid(nid, value)
                    .map_err(|e| CryptoError::BadInput(format!("Invalid subject field: {}", e)))?;
            }
        }
        let name = name.build();

        let mut builder = X509ReqBuilder::new().map_err(crypto_err("Failed to create CSR builder"))?;
        builder
            .set_version(0)
            .map_err(crypto_err("Failed to set CSR version"))?;
        builder
            .set_subject_name(&name)
            .map_err(crypto_err("Failed to set CSR subject"))?;
        builder
            .set_pubkey(self.key)
            .map_err(|e| CryptoError::BadKey(format!("Failed to set CSR key: {}", e)))?;
        builder
            .sign(self.key, self.signature_algorithm.digest().message_digest())
            .map_err(|e| CryptoError::BadKey(format!("Failed to sign CSR: {}", e)))?;
        Ok(builder.build())
    }

    pub fn build_der(self) -> Result<Vec<u8>, CryptoError> {
        self.build()?
            .to_der()
            .map_err(crypto_err("Failed to encode CSR"))
    }
}
