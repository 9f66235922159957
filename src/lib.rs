//! PKI Mailbox - certificate authority and end-to-end encrypted message exchange
//!
//! Two TLS services and the library their clients use:
//!
//! ```text
//! client ──sign / check──▶ PKI service (CA, serial counter, revocation list)
//!    │                          ▲
//!    │ mutual TLS               │ check (optional cross-check)
//!    ▼                          │
//! message exchange server ──────┘
//! ```
//!
//! - The **PKI service** issues user certificates from PKCS#10 requests and
//!   answers revocation checks by serial number.
//! - The **message exchange server** keeps mailboxes, messages and read
//!   receipts. Every request arrives over mutual TLS and is bound to the
//!   public key of the presented certificate.
//! - The **client library** seals messages end to end: DH-derived keys,
//!   symmetric encryption, an HMAC per field and a signature over the whole.
//!   The server only ever stores ciphertext.
//!
//! # Wire format
//!
//! One JSON value per connection in each direction:
//!
//! ```text
//! → {"type": "send", "nonce": "...", "senderId": 1, ...}
//! ← {"status": {"code": 200, "message": "OK"}, "nonce": "...", "payload": {...}}
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pki_mailbox::client::mailbox::MailboxClient;
//! use pki_mailbox::configs::ClientConfig;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ClientConfig::from_file("client.toml")?;
//! let client = MailboxClient::from_config(&config)?;
//! for id in client.new_messages(1)? {
//!     let message = client.receive(id)?;
//!     println!("message {} from {}", message.id, message.sender_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod commands;
pub mod configs;
pub mod crypto;
pub mod error;
pub mod keystore;
pub mod logging;
pub mod pki;
pub mod protocol;
pub mod server;
pub mod tls;
pub mod transport;
