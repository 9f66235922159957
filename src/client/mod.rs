//! Client library for the PKI service and the message server.
//!
//! [`pki::PkiClient`] obtains and checks certificates, [`mailbox::MailboxClient`]
//! speaks the message-server routes and [`session`] holds the end-to-end layer
//! that turns plaintext into the opaque fields the server stores.

pub mod attachments;
pub mod csr;
pub mod mailbox;
pub mod pki;
pub mod session;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::error::ServiceError;
use crate::transport::ExchangeError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    /// The service answered with a non-200 status.
    #[error("Request failed with {code}: {message}")]
    Rejected { code: u16, message: String },

    #[error("Response nonce does not match the request")]
    NonceMismatch,

    /// Local setup or response decoding failed.
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Invalid attachment: {0}")]
    Attachment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Status code of a rejected request, if that is what this is.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ClientError::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

pub(crate) fn encode_request<T: serde::Serialize>(request: &T, nonce: Option<&str>) -> Result<Vec<u8>> {
    crate::protocol::serialize_request(request, nonce).map_err(|e| {
        ClientError::Service(ServiceError::InvalidFormat(format!(
            "Failed to encode request: {}",
            e
        )))
    })
}
