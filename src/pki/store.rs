//! Issued/revoked certificate tables and the serial counter.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;

const SERIAL_COUNTER: &str = "serial";

/// Revocation state of an issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevocationState {
    Issued,
    Revoked { at: String },
}

impl RevocationState {
    pub fn is_revoked(&self) -> bool {
        matches!(self, RevocationState::Revoked { .. })
    }
}

pub struct PkiStore {
    conn: Mutex<Connection>,
}

impl PkiStore {
    /// Open (or create) the database; `":memory:"` gives a private in-memory one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS issued (
                serial INTEGER PRIMARY KEY,
                subject TEXT NOT NULL,
                not_after TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS revoked (
                serial INTEGER PRIMARY KEY REFERENCES issued(serial),
                at TEXT NOT NULL
            );",
        )?;

        Ok(PkiStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the next serial. The counter is committed before the
    /// certificate is built, so a failed issuance burns its serial rather
    /// than letting it be reused.
    pub fn next_serial(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO counters (name, value) VALUES (?1, 1)",
            params![SERIAL_COUNTER],
        )?;
        let serial: i64 = tx.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![SERIAL_COUNTER],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE counters SET value = value + 1 WHERE name = ?1",
            params![SERIAL_COUNTER],
        )?;
        tx.commit()?;
        Ok(serial as u64)
    }

    pub fn record_issued(
        &self,
        serial: u64,
        subject: &str,
        not_after: &str,
    ) -> Result<(), StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO issued (serial, subject, not_after) VALUES (?1, ?2, ?3)",
            params![serial as i64, subject, not_after],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(format!(
                "Serial {} already issued.",
                serial
            )));
        }
        Ok(())
    }

    pub fn revocation_state(&self, serial: u64) -> Result<RevocationState, StoreError> {
        let conn = self.conn();
        let row: Option<Option<String>> = conn
            .query_row(
                "SELECT r.at FROM issued i LEFT JOIN revoked r ON r.serial = i.serial
                 WHERE i.serial = ?1",
                params![serial as i64],
                |row| row.get(0),
            )
            .optional()?;
        match row {
            None => Err(StoreError::NotFound(format!(
                "Serial {} was never issued.",
                serial
            ))),
            Some(None) => Ok(RevocationState::Issued),
            Some(Some(at)) => Ok(RevocationState::Revoked { at }),
        }
    }

    /// The one-way ISSUED → REVOKED transition.
    pub fn revoke(&self, serial: u64, at: DateTime<Utc>) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let issued: bool = tx
            .query_row(
                "SELECT 1 FROM issued WHERE serial = ?1",
                params![serial as i64],
                |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false);
        if !issued {
            return Err(StoreError::NotFound(format!(
                "Serial {} was never issued.",
                serial
            )));
        }
        let at = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO revoked (serial, at) VALUES (?1, ?2)",
            params![serial as i64, at],
        )?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(format!(
                "Serial {} is already revoked.",
                serial
            )));
        }
        tx.commit()?;
        Ok(at)
    }

    /// Number of issued and revoked certificates.
    pub fn counts(&self) -> Result<(u64, u64), StoreError> {
        let conn = self.conn();
        let issued: i64 = conn.query_row("SELECT COUNT(*) FROM issued", [], |row| row.get(0))?;
        let revoked: i64 = conn.query_row("SELECT COUNT(*) FROM revoked", [], |row| row.get(0))?;
        Ok((issued as u64, revoked as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_serials_increase_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pki.db");

        let store = PkiStore::open(&path).unwrap();
        assert_eq!(store.next_serial().unwrap(), 1);
        assert_eq!(store.next_serial().unwrap(), 2);
        drop(store);

        let store = PkiStore::open(&path).unwrap();
        assert_eq!(store.next_serial().unwrap(), 3);
    }

    #[test]
    fn test_issue_and_revoke() {
        let store = PkiStore::open(":memory:").unwrap();
        let serial = store.next_serial().unwrap();
        store
            .record_issued(serial, "CN=alice", "2030-01-01T00:00:00Z")
            .unwrap();
        assert_eq!(
            store.revocation_state(serial).unwrap(),
            RevocationState::Issued
        );

        let at = store.revoke(serial, Utc::now()).unwrap();
        assert_eq!(
            store.revocation_state(serial).unwrap(),
            RevocationState::Revoked { at }
        );
        assert_eq!(store.counts().unwrap(), (1, 1));
    }

    #[test]
    fn test_revoke_edge_cases() {
        let store = PkiStore::open(":memory:").unwrap();
        assert!(matches!(
            store.revoke(99, Utc::now()),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.revocation_state(99),
            Err(StoreError::NotFound(_))
        ));

        store.record_issued(5, "CN=bob", "2030-01-01T00:00:00Z").unwrap();
        store.revoke(5, Utc::now()).unwrap();
        assert!(matches!(
            store.revoke(5, Utc::now()),
            Err(StoreError::Duplicate(_))
        ));
        assert!(matches!(
            store.record_issued(5, "CN=bob", "2030-01-01T00:00:00Z"),
            Err(StoreError::Duplicate(_))
        ));
    }
}
