//! Alphaloop CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use alphaloop::application::{IterationExecutor, LearningLoop, ShutdownHandle};
use alphaloop::cli::{
    render_history_summary, render_run_summary, Cli, Commands, EXIT_CANCELLED, EXIT_FATAL,
    EXIT_OK,
};
use alphaloop::domain::models::config::Config;
use alphaloop::domain::ports::data_accessor::FieldManifest;
use alphaloop::domain::ports::llm_client::LlmClient;
use alphaloop::domain::ports::monitor::{MonitorEvent, MonitorSink};
use alphaloop::infrastructure::config::ConfigLoader;
use alphaloop::infrastructure::{HttpLlmClient, SandboxExecutor, TracingSink};
use alphaloop::services::champion_tracker::ChampionTracker;
use alphaloop::services::history::IterationHistory;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Summary { history } => {
            let config = ConfigLoader::load()?;
            let path = history
                .unwrap_or_else(|| std::path::PathBuf::from(&config.engine.history_path));
            print!("{}", render_history_summary(&path)?);
            Ok(EXIT_OK)
        }
        Commands::Run {
            max_iterations,
            config,
            resume,
            history,
        } => {
            let mut config = match config {
                Some(path) => ConfigLoader::load_from_file(path)?,
                None => ConfigLoader::load()?,
            };
            if let Some(n) = max_iterations {
                config.engine.max_iterations = n;
            }
            if let Some(path) = history {
                config.engine.history_path = path.display().to_string();
            }
            run(config, resume).await
        }
    }
}

async fn run(config: Config, resume: bool) -> Result<i32> {
    let _log_guard = alphaloop::infrastructure::logging::init(&config.logging)?;

    let history = IterationHistory::open(&config.engine.history_path)
        .context("Failed to open iteration history")?;
    if !history.is_empty() && !resume {
        anyhow::bail!(
            "history at {} already holds {} records; pass --resume to continue it or \
             --history for a fresh path",
            config.engine.history_path,
            history.len()
        );
    }

    let manifest = load_manifest(&config)?;
    let llm = build_llm(&config);
    let champion = ChampionTracker::load(
        &config.engine.champion_path,
        config.champion.clone(),
        &config.market,
    );
    let sandbox = SandboxExecutor::new(
        config.sandbox.clone(),
        config.backtest.clone(),
        config.data.clone(),
    );
    let registry = sandbox.registry();
    let monitor = Arc::new(TracingSink);

    // Periodic reaper reconciliation: scan and force-kill leftovers.
    let reaper_monitor = monitor.clone();
    let reaper = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        loop {
            tick.tick().await;
            let reaped = registry.reap_orphans();
            if reaped > 0 {
                reaper_monitor.emit(MonitorEvent::OrphansReaped(reaped));
            }
        }
    });

    let executor = IterationExecutor::new(
        config.clone(),
        manifest,
        llm,
        sandbox,
        history,
        champion,
        monitor,
    );
    let shutdown = ShutdownHandle::new();
    let mut learning_loop = LearningLoop::new(
        executor,
        config.engine.max_iterations,
        config.engine.iteration_timeout_secs,
        shutdown.clone(),
    );

    let signal_handle = shutdown.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            if signal_handle.request() {
                tracing::warn!("Second cancel signal; forcing termination");
                return;
            }
            tracing::info!("Cancel requested; finishing the current iteration");
        }
    });

    let outcome = learning_loop.run().await;
    reaper.abort();

    match outcome {
        Ok(summary) => {
            print!("{}", render_run_summary(&summary));
            Ok(if summary.cancelled {
                EXIT_CANCELLED
            } else {
                EXIT_OK
            })
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            Ok(EXIT_FATAL)
        }
    }
}

/// The manifest is needed in-process (validator, prompts) even though
/// workers load their own data copies.
fn load_manifest(config: &Config) -> Result<FieldManifest> {
    let raw = std::fs::read_to_string(&config.data.manifest_path).with_context(|| {
        format!("Failed to read data manifest {}", config.data.manifest_path)
    })?;
    serde_yaml::from_str(&raw).context("Failed to parse data manifest")
}

/// LLM client, or none: a missing key degrades to factor-graph-only
/// mode rather than failing startup.
fn build_llm(config: &Config) -> Option<Arc<dyn LlmClient>> {
    match HttpLlmClient::from_config(&config.llm) {
        Ok(client) if client.is_configured() => Some(Arc::new(client)),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build LLM client; factor-graph-only mode");
            None
        }
    }
}
