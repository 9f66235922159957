use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::pki::root_ca::RsaRootCABuilder;

/// Files written by [`handle_init_ca`].
#[derive(Debug, Clone)]
pub struct CaFiles {
    /// Private key followed by the certificate; usable as a PEM keystore.
    pub keystore: PathBuf,
    /// Certificate alone; usable as a PEM truststore.
    pub certificate: PathBuf,
}

/// Options for a new self-signed CA.
#[derive(Debug, Clone)]
pub struct InitCaOptions {
    pub common_name: String,
    pub organization: Option<String>,
    pub validity_days: u32,
    pub key_size: u32,
}

/// Handle the `init-ca` command
///
/// Generates a self-signed CA and writes `ca.pem` (key and certificate) and
/// `ca.crt` (certificate) into `out_dir`. Existing files are never replaced.
///
/// # Arguments
///
/// * `out_dir` - Directory receiving the files, created if missing
/// * `options` - Subject and key parameters
///
/// # Returns
///
/// * `Result<CaFiles>` - Paths of the written files
pub fn handle_init_ca(out_dir: &Path, options: &InitCaOptions) -> Result<CaFiles> {
    let files = CaFiles {
        keystore: out_dir.join("ca.pem"),
        certificate: out_dir.join("ca.crt"),
    };
    for path in [&files.keystore, &files.certificate] {
        if path.exists() {
            return Err(anyhow!("Refusing to overwrite {}", path.display()));
        }
    }

    let mut builder = RsaRootCABuilder::new()
        .subject_common_name(options.common_name.clone())
        .validity_days(options.validity_days)
        .key_size(options.key_size);
    if let Some(org) = &options.organization {
        builder = builder.organization(org.clone());
    }
    let (key, cert) = builder.build().context("Failed to generate CA")?;

    let key_pem = key
        .private_key_to_pem_pkcs8()
        .map_err(|e| anyhow!("Failed to encode CA key: {}", e))?;
    let cert_pem = cert
        .to_pem()
        .map_err(|e| anyhow!("Failed to encode CA certificate: {}", e))?;

    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    let mut keystore = key_pem;
    keystore.extend_from_slice(&cert_pem);
    write_private(&files.keystore, &keystore)?;
    fs::write(&files.certificate, &cert_pem)
        .with_context(|| format!("Failed to write {}", files.certificate.display()))?;

    info!(
        "CA {} written to {}",
        options.common_name,
        out_dir.display()
    );
    Ok(files)
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::certificate::subject_common_name;
    use crate::keystore::KeyStore;
    use tempfile::tempdir;

    fn options() -> InitCaOptions {
        InitCaOptions {
            common_name: "Mailbox Test CA".to_string(),
            organization: Some("Test Org".to_string()),
            validity_days: 30,
            key_size: 2048,
        }
    }

    #[test]
    fn test_written_files_load_as_keystore() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("ca");
        let files = handle_init_ca(&out, &options()).unwrap();

        let keystore = KeyStore::from_pem_file(&files.keystore, None).unwrap();
        assert_eq!(subject_common_name(keystore.certificate()), "Mailbox Test CA");
        let cert = openssl::x509::X509::from_pem(&fs::read(&files.certificate).unwrap()).unwrap();
        assert_eq!(
            cert.to_der().unwrap(),
            keystore.certificate().to_der().unwrap()
        );
    }

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        handle_init_ca(dir.path(), &options()).unwrap();
        assert!(handle_init_ca(dir.path(), &options()).is_err());
    }
}
