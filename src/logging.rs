//! `tracing` subscriber setup shared by both services.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Logs go to stderr and, when `log_file` is given, are appended to that file
/// as well. `debug` lowers the default level from INFO to DEBUG; `RUST_LOG`
/// directives still apply on top.
pub fn init(debug: bool, log_file: Option<&Path>) -> Result<()> {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    match log_file {
        Some(path) => {
            let file = open_log_file(path)?;
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_names(true)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(Mutex::new(file)))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
        None => {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_names(true)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to set subscriber")?;
        }
    }
    Ok(())
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context(format!("Failed to open log file {}", path.display()))
}

/// Log an unexpected error; the full chain is only printed in debug mode.
pub fn log_unexpected(debug: bool, context: &str, err: &dyn std::error::Error) {
    if debug {
        tracing::error!("{}: {:?}", context, err);
    } else {
        tracing::error!("{}: {}", context, err);
    }
}
