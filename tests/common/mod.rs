//! Shared fixtures for the end-to-end scenario tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use alphaloop::domain::models::config::{Config, RebalanceFrequency};
use alphaloop::domain::ports::data_accessor::FieldManifest;
use alphaloop::domain::ports::llm_client::LlmClient;
use alphaloop::infrastructure::monitor::InMemorySink;
use alphaloop::infrastructure::SandboxExecutor;
use alphaloop::services::champion_tracker::ChampionTracker;
use alphaloop::services::history::IterationHistory;
use alphaloop::IterationExecutor;

/// A schema-valid reply for the momentum template.
pub const VALID_MOMENTUM_REPLY: &str = r#"{"lookback": 30, "portfolio_size": 5,
    "min_turnover": 80000000.0, "stop_fraction": 0.08, "weighting": "equal"}"#;

/// A schema-valid reply for the mean-reversion template.
pub const VALID_MEAN_REVERSION_REPLY: &str =
    r#"{"window": 20, "portfolio_size": 6, "min_turnover": 60000000.0}"#;

/// A schema-valid reply for the breakout template.
pub const VALID_BREAKOUT_REPLY: &str = r#"{"window": 40, "portfolio_size": 6,
    "min_turnover": 50000000.0, "stop_fraction": 0.10}"#;

/// Write a manifest plus synthetic matrix CSVs under `dir`.
///
/// 160 trading dates over 6 symbols with per-symbol drift, ample
/// turnover, and a forbidden raw-price key in the manifest.
pub fn write_market_fixture(dir: &Path) {
    std::fs::write(
        dir.join("manifest.yaml"),
        "fields:\n\
         \x20 close_adj: adjusted_price\n\
         \x20 open_adj: adjusted_price\n\
         \x20 close_raw: raw_price\n\
         \x20 turnover: liquidity\n\
         \x20 volume: liquidity\n",
    )
    .unwrap();

    let data_dir = dir.join("data");
    std::fs::create_dir_all(&data_dir).unwrap();

    let n_dates = 160;
    let n_symbols = 6;
    let start = chrono::NaiveDate::from_ymd_opt(2022, 1, 3).unwrap();
    let header: String = std::iter::once("date".to_string())
        .chain((0..n_symbols).map(|j| format!("23{j:02}")))
        .collect::<Vec<_>>()
        .join(",");

    let matrix = |cell: &dyn Fn(usize, usize) -> f64| -> String {
        let mut out = header.clone();
        out.push('\n');
        for i in 0..n_dates {
            let date = start + chrono::Duration::days(i as i64);
            out.push_str(&date.format("%Y-%m-%d").to_string());
            for j in 0..n_symbols {
                out.push_str(&format!(",{:.6}", cell(i, j)));
            }
            out.push('\n');
        }
        out
    };

    let price = |i: usize, j: usize| -> f64 {
        let drift = (j as f64 - n_symbols as f64 / 2.0) * 0.002;
        let wiggle = ((i * 31 + j * 17) % 7) as f64 * 0.3;
        100.0 * (1.0 + drift).powi(i as i32) + wiggle
    };
    std::fs::write(data_dir.join("close_adj.csv"), matrix(&price)).unwrap();
    std::fs::write(
        data_dir.join("open_adj.csv"),
        matrix(&|i, j| price(i, j) * 0.999),
    )
    .unwrap();
    std::fs::write(data_dir.join("close_raw.csv"), matrix(&price)).unwrap();
    std::fs::write(
        data_dir.join("turnover.csv"),
        matrix(&|_, j| 2e8 + j as f64 * 1e7),
    )
    .unwrap();
    std::fs::write(
        data_dir.join("volume.csv"),
        matrix(&|_, j| 5e6 + j as f64 * 1e5),
    )
    .unwrap();
}

/// Engine configuration wired to a state directory and the real worker
/// binary Cargo built alongside the tests.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.engine.history_path = dir.join("history.jsonl").display().to_string();
    config.engine.champion_path = dir.join("champion.json").display().to_string();
    config.engine.failures_dir = Some(dir.join("failures").display().to_string());
    config.engine.recent_window = 10;
    config.engine.seed = 7;
    config.sandbox.worker_binary =
        Some(env!("CARGO_BIN_EXE_alphaloop-worker").to_string());
    config.sandbox.timeout_secs = 30;
    config.sandbox.kill_grace_secs = 1;
    config.backtest.rebalance = RebalanceFrequency::Weekly;
    config.data.manifest_path = dir.join("manifest.yaml").display().to_string();
    config.data.data_dir = dir.join("data").display().to_string();
    config
}

pub fn load_manifest(config: &Config) -> FieldManifest {
    let raw = std::fs::read_to_string(&config.data.manifest_path).unwrap();
    serde_yaml::from_str(&raw).unwrap()
}

/// Build an executor over a prepared state directory.
pub fn build_executor(
    config: &Config,
    llm: Option<Arc<dyn LlmClient>>,
    monitor: Arc<InMemorySink>,
) -> IterationExecutor {
    let manifest = load_manifest(config);
    let history = IterationHistory::open(&config.engine.history_path).unwrap();
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
    IterationExecutor::new(
        config.clone(),
        manifest,
        llm,
        sandbox,
        history,
        champion,
        monitor,
    )
}
