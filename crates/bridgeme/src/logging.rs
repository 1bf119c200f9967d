//! Process-wide logging setup.
//!
//! Logs go to stderr, or to `logging.file` through a non-blocking writer.
//! `RUST_LOG` overrides every other level source when set.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Which part of the CLI is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Host mode and control commands.
    Host,
    /// Client mode: the terminal is raw, so the console gets warnings only.
    Client,
}

/// Level overrides from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFlags {
    /// `-v`: debug logging.
    pub verbose: bool,
    /// `--debug`: trace logging.
    pub debug: bool,
}

/// Resolves the effective level for the given configuration and flags.
pub fn effective_level(config: &LoggingConfig, flags: LogFlags, mode: LogMode) -> String {
    let level = if flags.debug {
        "trace"
    } else if flags.verbose {
        "debug"
    } else {
        config.level.as_str()
    };

    if mode == LogMode::Client && config.file.is_none() && !matches!(level, "warn" | "error") {
        return "warn".to_string();
    }
    level.to_string()
}

/// Installs the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held
/// until exit.
pub fn init(config: &LoggingConfig, flags: LogFlags, mode: LogMode) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(effective_level(config, flags, mode)));

    match &config.file {
        Some(path) => {
            let (writer, guard) = tracing_appender::non_blocking(open_log_file(path)?);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .context("Failed to install logger")?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .context("Failed to install logger")?;
            Ok(None)
        }
    }
}

fn open_log_file(path: &Path) -> Result<fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}
