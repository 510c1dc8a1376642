//! Configuration loading with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid innovation_rate: {0}. Must be within [0, 1]")]
    InvalidInnovationRate(f64),

    #[error("Invalid max_iterations: 0")]
    ZeroMaxIterations,

    #[error("Invalid sandbox timeout: 0 seconds")]
    ZeroSandboxTimeout,

    #[error("Invalid max_concurrency: 0")]
    ZeroConcurrency,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("History path cannot be empty")]
    EmptyHistoryPath,

    #[error("Champion path cannot be empty")]
    EmptyChampionPath,

    #[error("Data manifest path cannot be empty")]
    EmptyManifestPath,

    #[error("Invalid llm retry_max: {0}. Must be at most 3")]
    RetryMaxTooLarge(u32),

    #[error(
        "Invalid drawdown bound: {0}. Must be a positive fraction (e.g. 0.35 for 35%)"
    )]
    InvalidDrawdownBound(f64),

    #[error("Backtest window inverted: start {start} after end {end}")]
    InvertedWindow {
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    #[error(
        "Invalid champion margins: base_margin ({base}) must not exceed margin_max ({max})"
    )]
    InvalidMargins { base: f64, max: f64 },
}

/// Loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. `.alphaloop/config.yaml` (project config)
    /// 3. `.alphaloop/local.yaml` (project local overrides, optional)
    /// 4. Environment variables (`ALPHALOOP_*` prefix, highest priority)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".alphaloop/config.yaml"))
            .merge(Yaml::file(".alphaloop/local.yaml"))
            .merge(Env::prefixed("ALPHALOOP_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("ALPHALOOP_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&config.engine.innovation_rate) {
            return Err(ConfigError::InvalidInnovationRate(
                config.engine.innovation_rate,
            ));
        }
        if config.engine.max_iterations == 0 {
            return Err(ConfigError::ZeroMaxIterations);
        }
        if config.engine.history_path.is_empty() {
            return Err(ConfigError::EmptyHistoryPath);
        }
        if config.engine.champion_path.is_empty() {
            return Err(ConfigError::EmptyChampionPath);
        }

        if config.sandbox.timeout_secs == 0 {
            return Err(ConfigError::ZeroSandboxTimeout);
        }
        if config.sandbox.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.data.manifest_path.is_empty() {
            return Err(ConfigError::EmptyManifestPath);
        }

        // The schema-retry bound is part of the generation contract: a
        // single iteration issues at most retry_max + 1 LLM calls.
        if config.llm.retry_max > 3 {
            return Err(ConfigError::RetryMaxTooLarge(config.llm.retry_max));
        }

        if config.market.max_drawdown_bound <= 0.0 || config.market.max_drawdown_bound > 1.0 {
            return Err(ConfigError::InvalidDrawdownBound(
                config.market.max_drawdown_bound,
            ));
        }

        if let (Some(start), Some(end)) =
            (config.backtest.start_date, config.backtest.end_date)
        {
            if start > end {
                return Err(ConfigError::InvertedWindow { start, end });
            }
        }

        if config.champion.base_margin > config.champion.margin_max {
            return Err(ConfigError::InvalidMargins {
                base: config.champion.base_margin,
                max: config.champion.margin_max,
            });
        }

        Ok(())
    }
}
