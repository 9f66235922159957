//! PKI Service.
//!
//! Server-authenticated TLS endpoint that signs CSRs with the CA key and
//! answers revocation checks from its issued/revoked tables.

pub mod issuer;
pub mod root_ca;
pub mod service;
pub mod store;

pub use service::{bind, run, PkiService};
