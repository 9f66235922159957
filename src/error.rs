//! Error kinds shared by both services.
//!
//! Every failure that reaches a client is one of the [`ErrorKind`]s below and
//! is reported with exactly one HTTP-style status. The mapping lives in
//! [`STATUS_TABLE`] and nowhere else.

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::Status;

/// Classification of a request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRoute,
    InvalidFormat,
    MissingValue,
    DuplicateEntry,
    EntryNotFound,
    AuthorisationFailed,
    CryptoFailure,
    UpstreamUnavailable,
    CriticalDatabase,
    InvalidConfiguration,
}

/// Kind to status code table.
pub const STATUS_TABLE: [(ErrorKind, u16); 10] = [
    (ErrorKind::InvalidRoute, 400),
    (ErrorKind::InvalidFormat, 400),
    (ErrorKind::MissingValue, 400),
    (ErrorKind::DuplicateEntry, 400),
    (ErrorKind::EntryNotFound, 404),
    (ErrorKind::AuthorisationFailed, 403),
    (ErrorKind::CryptoFailure, 400),
    (ErrorKind::UpstreamUnavailable, 502),
    (ErrorKind::CriticalDatabase, 500),
    (ErrorKind::InvalidConfiguration, 500),
];

impl ErrorKind {
    pub fn status_code(self) -> u16 {
        STATUS_TABLE
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, code)| *code)
            .unwrap_or(500)
    }

    pub fn status(self) -> Status {
        Status::from_code(self.status_code())
    }

    /// Fatal kinds terminate the connection with a generic 500 body.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ErrorKind::CriticalDatabase | ErrorKind::InvalidConfiguration
        )
    }
}

/// Failure raised while serving a request.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid route.")]
    InvalidRoute,

    #[error("{0}")]
    InvalidFormat(String),

    #[error("Missing value: {0}")]
    MissingValue(String),

    #[error("{0}")]
    DuplicateEntry(String),

    #[error("{0}")]
    EntryNotFound(String),

    #[error("{0}")]
    AuthorisationFailed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("{0}")]
    UpstreamUnavailable(String),

    #[error("Critical database error: {0}")]
    CriticalDatabase(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::InvalidRoute => ErrorKind::InvalidRoute,
            ServiceError::InvalidFormat(_) => ErrorKind::InvalidFormat,
            ServiceError::MissingValue(_) => ErrorKind::MissingValue,
            ServiceError::DuplicateEntry(_) => ErrorKind::DuplicateEntry,
            ServiceError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            ServiceError::AuthorisationFailed(_) => ErrorKind::AuthorisationFailed,
            ServiceError::Crypto(_) => ErrorKind::CryptoFailure,
            ServiceError::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            ServiceError::CriticalDatabase(_) => ErrorKind::CriticalDatabase,
            ServiceError::InvalidConfiguration(_) => ErrorKind::InvalidConfiguration,
        }
    }

    pub fn status(&self) -> Status {
        self.kind().status()
    }

    /// Message placed in the `error` field of the response.
    ///
    /// Fatal errors never leak their internals to the peer.
    pub fn public_message(&self) -> String {
        if self.kind().is_fatal() {
            "Internal server error.".to_string()
        } else {
            self.to_string()
        }
    }
}

/// Failure raised by the SQLite-backed stores.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate entry: {0}")]
    Duplicate(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => ServiceError::DuplicateEntry(what),
            StoreError::NotFound(what) => ServiceError::EntryNotFound(what),
            StoreError::Database(e) => ServiceError::CriticalDatabase(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_kind_has_exactly_one_status() {
        let kinds: HashSet<ErrorKind> = STATUS_TABLE.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds.len(), STATUS_TABLE.len());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ErrorKind::InvalidRoute.status_code(), 400);
        assert_eq!(ErrorKind::DuplicateEntry.status_code(), 400);
        assert_eq!(ErrorKind::EntryNotFound.status_code(), 404);
        assert_eq!(ErrorKind::AuthorisationFailed.status_code(), 403);
        assert_eq!(ErrorKind::UpstreamUnavailable.status_code(), 502);
        assert_eq!(ErrorKind::CriticalDatabase.status_code(), 500);
        assert_eq!(ErrorKind::InvalidConfiguration.status_code(), 500);
    }

    #[test]
    fn test_store_errors_convert_to_kinds() {
        let dup: ServiceError = StoreError::Duplicate("uuid".into()).into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateEntry);
        let missing: ServiceError = StoreError::NotFound("message".into()).into();
        assert_eq!(missing.kind(), ErrorKind::EntryNotFound);
    }

    #[test]
    fn test_fatal_errors_hide_details() {
        let err = ServiceError::CriticalDatabase("disk I/O error at /var/db".into());
        assert_eq!(err.public_message(), "Internal server error.");
        assert_eq!(err.status().code, 500);
    }
}
