//! Message Exchange Server.
//!
//! Mutual-TLS endpoint over the mailbox store. The peer certificate is the
//! identity for the whole connection; mailboxes are bound to its public key on
//! `create` and re-checked on `send` and `receipt`.

pub mod models;
pub mod params;
pub mod pki_link;
pub mod service;
pub mod store;

pub use service::{bind, run, MailboxService, PeerIdentity};
