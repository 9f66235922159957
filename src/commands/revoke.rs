use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crate::configs::PkiConfig;
use crate::pki::store::PkiStore;

/// Handle the `revoke` command
///
/// Marks an issued serial as revoked in the PKI database. Later revocation
/// checks for the serial answer `revoked`; the change cannot be undone.
///
/// # Arguments
///
/// * `config` - PKI configuration naming the database
/// * `serial` - Serial number of the certificate to revoke
///
/// # Returns
///
/// * `Result<String>` - The recorded revocation time (RFC 3339)
pub fn handle_revoke(config: &PkiConfig, serial: u64) -> Result<String> {
    let store = PkiStore::open(&config.database)
        .with_context(|| format!("Failed to open {}", config.database.display()))?;
    let at = store
        .revoke(serial, Utc::now())
        .with_context(|| format!("Failed to revoke serial {}", serial))?;
    info!("Revoked certificate serial {} at {}", serial, at);
    Ok(at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(database: &std::path::Path) -> PkiConfig {
        toml::from_str(&format!(
            r#"
            threads = 1
            database = '{}'

            [keystore]
            location = "ca.pem"
            type = "PEM"
            "#,
            database.display()
        ))
        .unwrap()
    }

    #[test]
    fn test_revoke_issued_serial_once() {
        let dir = tempdir().unwrap();
        let config = config(&dir.path().join("pki.db"));
        {
            let store = PkiStore::open(&config.database).unwrap();
            let serial = store.next_serial().unwrap();
            store
                .record_issued(serial, "CN=alice", "2030-01-01T00:00:00Z")
                .unwrap();
            assert_eq!(serial, 1);
        }

        handle_revoke(&config, 1).unwrap();
        assert!(handle_revoke(&config, 1).is_err());
        assert!(handle_revoke(&config, 99).is_err());

        let store = PkiStore::open(&config.database).unwrap();
        assert!(store.revocation_state(1).unwrap().is_revoked());
    }
}
