//! Structured logging via tracing-subscriber.
//!
//! Format (json/pretty) and level come from configuration; `RUST_LOG`
//! overrides the level when set. An optional non-blocking file writer
//! duplicates output for long unattended runs.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::domain::models::config::LoggingConfig;

/// Guard keeping the non-blocking file writer alive; drop flushes.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialize the global subscriber once, from config.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("alphaloop={}", config.level)));

    let file_guard = if let Some(path) = &config.file {
        let path = std::path::Path::new(path);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path
            .file_name()
            .context("log file path has no file name")?;
        let appender = tracing_appender::rolling::never(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        if config.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .json()
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
        }
        Some(guard)
    } else {
        if config.format == "json" {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to init logging: {e}"))?;
        }
        None
    };

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}
