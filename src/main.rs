//! pki-mailbox command line
//!
//! Runs the PKI service or the message exchange server from a TOML
//! configuration, and provides the one-shot CA administration commands.
//!
//! ```bash
//! pki-mailbox init-ca --out ca --common-name "Mailbox Root CA"
//! pki-mailbox pki --config pki.toml
//! pki-mailbox server --config server.toml
//! pki-mailbox revoke --config pki.toml --serial 7
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use pki_mailbox::commands::init_ca::{handle_init_ca, InitCaOptions};
use pki_mailbox::commands::revoke::handle_revoke;
use pki_mailbox::configs::{PkiConfig, ServerConfig};
use pki_mailbox::{logging, pki, server};

/// Certificate authority and encrypted mailbox exchange
#[derive(Parser, Debug)]
#[command(name = "pki-mailbox")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the PKI service (certificate signing and revocation checks)
    Pki {
        /// Path to the PKI configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Run the message exchange server
    Server {
        /// Path to the server configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Generate a self-signed CA keystore for the PKI service
    InitCa {
        /// Output directory for ca.pem and ca.crt
        #[arg(short, long)]
        out: PathBuf,

        /// Subject common name of the CA
        #[arg(long)]
        common_name: String,

        /// Subject organization
        #[arg(long)]
        organization: Option<String>,

        /// Certificate lifetime in days
        #[arg(long, default_value = "3650")]
        validity_days: u32,

        /// RSA modulus size in bits
        #[arg(long, default_value = "4096")]
        key_size: u32,

        /// Enable debug logging
        #[arg(long)]
        debug: bool,
    },

    /// Revoke an issued certificate by serial number
    Revoke {
        /// Path to the PKI configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Serial number to revoke
        #[arg(short, long)]
        serial: u64,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Pki { config } => {
            let config = PkiConfig::from_file(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            logging::init(config.debug, config.log_file.as_deref())?;
            info!("Starting PKI service");
            pki::run(&config).context("PKI service stopped")?;
        }
        Command::Server { config } => {
            let config = ServerConfig::from_file(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            logging::init(config.debug, config.log_file.as_deref())?;
            info!("Starting message exchange server");
            server::run(&config).context("Message server stopped")?;
        }
        Command::InitCa {
            out,
            common_name,
            organization,
            validity_days,
            key_size,
            debug,
        } => {
            logging::init(debug, None)?;
            let files = handle_init_ca(
                &out,
                &InitCaOptions {
                    common_name,
                    organization,
                    validity_days,
                    key_size,
                },
            )?;
            println!("✓ CA keystore: {}", files.keystore.display());
            println!("✓ CA certificate: {}", files.certificate.display());
        }
        Command::Revoke { config, serial } => {
            let config = PkiConfig::from_file(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;
            logging::init(config.debug, config.log_file.as_deref())?;
            let at = handle_revoke(&config, serial)?;
            println!("✓ Serial {} revoked at {}", serial, at);
        }
    }

    Ok(())
}
