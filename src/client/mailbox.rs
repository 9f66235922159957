//! Client side of the message server routes.

use std::time::Duration;

use openssl::ssl::SslConnector;
use tracing::debug;

use crate::configs::ClientConfig;
use crate::crypto::random;
use crate::keystore::{KeyStore, TrustStore};
use crate::protocol::{MailboxRequest, Response, WireRequest};
use crate::server::models::{Message, Receipt, User};
use crate::server::params::ServerParams;
use crate::tls;
use crate::transport::exchange;

use super::session::{SealedMessage, SecondaryData};
use super::{encode_request, ClientError, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RESPONSE: u64 = 10 * 1024 * 1024;

/// Answer of the `all` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxIndex {
    /// Received ids; unread ones carry a leading `_`.
    pub received: Vec<String>,
    pub sent: Vec<i64>,
}

impl MailboxIndex {
    pub fn unread(&self) -> impl Iterator<Item = i64> + '_ {
        self.received
            .iter()
            .filter_map(|id| id.strip_prefix('_'))
            .filter_map(|id| id.parse().ok())
    }
}

/// Answer of the `status` route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatus {
    pub message: Message,
    pub receipts: Vec<Receipt>,
}

/// Mutual-TLS client, one connection per call.
pub struct MailboxClient {
    connector: SslConnector,
    host: String,
    port: u16,
    verify_hostname: bool,
    timeout: Duration,
    max_response_bytes: u64,
}

impl MailboxClient {
    /// `connector` must present the user's certificate.
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
        let keystore = KeyStore::load(&config.keystore)?;
        let truststore = TrustStore::load(&config.truststore)?;
        let connector = tls::build_connector(Some(&keystore), &truststore, &config.tls)?;
        Ok(
            Self::new(connector, config.server_address.clone(), config.server_port)
                .verify_hostname(config.tls.verify_hostname)
                .timeout(Duration::from_secs(config.timeout_secs))
                .max_response_bytes(config.max_response_bytes()),
        )
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

    /// Send one request; nonced routes get a fresh nonce that the response
    /// must echo.
    fn call(&self, request: &MailboxRequest) -> Result<Response> {
        let nonce = if request.needs_nonce() {
            Some(random::new_nonce()?)
        } else {
            None
        };
        let bytes = encode_request(request, nonce.as_deref())?;
        debug!("Sending {} request", request.route());
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
        if nonce.is_some() && response.nonce != nonce {
            return Err(ClientError::NonceMismatch);
        }
        Ok(response)
    }

    /// Register a mailbox for the certificate this client presents.
    pub fn create(&self, uuid: &str, data: SecondaryData) -> Result<i64> {
        Ok(self.call(&data.into_create_request(uuid))?.get("userId")?)
    }

    /// One user by id, or every user.
    pub fn list(&self, user_id: Option<i64>) -> Result<Vec<User>> {
        Ok(self.call(&MailboxRequest::List { user_id })?.get("users")?)
    }

    pub fn new_messages(&self, user_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .call(&MailboxRequest::New { user_id })?
            .get("newMessageIds")?)
    }

    pub fn all_messages(&self, user_id: i64) -> Result<MailboxIndex> {
        let response = self.call(&MailboxRequest::All { user_id })?;
        Ok(MailboxIndex {
            received: response.get("receivedMessageIds")?,
            sent: response.get("sentMessagesIds")?,
        })
    }

    pub fn send(&self, sender_id: i64, receiver_id: i64, sealed: SealedMessage) -> Result<i64> {
        let request = sealed.into_send_request(sender_id, receiver_id);
        Ok(self.call(&request)?.get("messageId")?)
    }

    pub fn receive(&self, message_id: i64) -> Result<Message> {
        Ok(self
            .call(&MailboxRequest::Receive { message_id })?
            .get("message")?)
    }

    pub fn receipt(&self, message_id: i64, receiver_signature: String, date: String) -> Result<()> {
        self.call(&MailboxRequest::Receipt {
            message_id,
            receiver_signature,
            date,
        })?;
        Ok(())
    }

    pub fn status(&self, message_id: i64) -> Result<MessageStatus> {
        let response = self.call(&MailboxRequest::Status { message_id })?;
        Ok(MessageStatus {
            message: response.get("message")?,
            receipts: response.get("receipts")?,
        })
    }

    pub fn params(&self) -> Result<ServerParams> {
        Ok(self.call(&MailboxRequest::Params)?.get("params")?)
    }
}
