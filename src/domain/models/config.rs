//! Engine configuration tree.
//!
//! Every section deserializes with serde defaults so a partial YAML file
//! (or environment overrides alone) produces a runnable configuration.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Top-level configuration snapshot passed into the learning loop.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub champion: ChampionPolicyConfig,
    #[serde(default)]
    pub mutation: MutationConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub feedback: FeedbackConfig,
    #[serde(default)]
    pub novelty: NoveltyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Outer loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct EngineConfig {
    /// Iterations to run before a normal exit.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,

    /// Probability that an iteration takes the LLM path.
    #[serde(default = "default_innovation_rate")]
    pub innovation_rate: f64,

    /// History window the feedback generator reads.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,

    /// Seed for every stochastic decision; fixed seed, fixed run.
    #[serde(default = "default_seed")]
    pub seed: u64,

    #[serde(default = "default_history_path")]
    pub history_path: String,

    #[serde(default = "default_champion_path")]
    pub champion_path: String,

    /// When set, level-0 iterations dump a structured error file here.
    #[serde(default)]
    pub failures_dir: Option<String>,

    /// Overall per-iteration budget, catching stuck components.
    #[serde(default = "default_iteration_timeout")]
    pub iteration_timeout_secs: u64,
}

const fn default_max_iterations() -> u64 {
    100
}

const fn default_innovation_rate() -> f64 {
    0.2
}

const fn default_recent_window() -> usize {
    20
}

const fn default_seed() -> u64 {
    42
}

fn default_history_path() -> String {
    ".alphaloop/history.jsonl".to_string()
}

fn default_champion_path() -> String {
    ".alphaloop/champion.json".to_string()
}

const fn default_iteration_timeout() -> u64 {
    600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            innovation_rate: default_innovation_rate(),
            recent_window: default_recent_window(),
            seed: default_seed(),
            history_path: default_history_path(),
            champion_path: default_champion_path(),
            failures_dir: None,
            iteration_timeout_secs: default_iteration_timeout(),
        }
    }
}

/// Market-aware thresholds. The dynamic threshold and the statistical
/// threshold are distinct and both reported; promotion uses the maximum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MarketConfig {
    /// Market-aware Sharpe bar for `level_3_acceptable`.
    #[serde(default = "default_dynamic_threshold")]
    pub dynamic_sharpe_threshold: f64,

    /// Bonferroni-corrected significance bar used by the validation
    /// frameworks downstream; never conflated with the dynamic one.
    #[serde(default = "default_statistical_threshold")]
    pub statistical_sharpe_threshold: f64,

    /// Acceptable drawdown magnitude (positive fraction).
    #[serde(default = "default_max_drawdown_bound")]
    pub max_drawdown_bound: f64,
}

const fn default_dynamic_threshold() -> f64 {
    0.8
}

const fn default_statistical_threshold() -> f64 {
    0.5
}

const fn default_max_drawdown_bound() -> f64 {
    0.35
}

impl MarketConfig {
    /// The bar promotion actually uses.
    pub fn promotion_threshold(&self) -> f64 {
        self.dynamic_sharpe_threshold
            .max(self.statistical_sharpe_threshold)
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            dynamic_sharpe_threshold: default_dynamic_threshold(),
            statistical_sharpe_threshold: default_statistical_threshold(),
            max_drawdown_bound: default_max_drawdown_bound(),
        }
    }
}

/// Worker isolation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,

    /// Address-space cap per worker.
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// CPU-seconds cap per worker.
    #[serde(default = "default_cpu_time_secs")]
    pub cpu_time_secs: u64,

    /// Writable scratch cap per worker.
    #[serde(default = "default_scratch_limit_mb")]
    pub scratch_limit_mb: u64,

    /// Parallel workers when the loop requests batched execution.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Seconds between SIGTERM and SIGKILL during reclamation.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Explicit worker binary path; discovered next to the current
    /// executable when unset.
    #[serde(default)]
    pub worker_binary: Option<String>,

    /// Run strategies in-process when the isolation runtime is
    /// unavailable. Loudly logged, off by default.
    #[serde(default)]
    pub allow_in_process_fallback: bool,
}

const fn default_sandbox_timeout() -> u64 {
    120
}

const fn default_memory_limit_mb() -> u64 {
    1024
}

const fn default_cpu_time_secs() -> u64 {
    110
}

const fn default_scratch_limit_mb() -> u64 {
    64
}

const fn default_max_concurrency() -> usize {
    4
}

const fn default_kill_grace() -> u64 {
    2
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_sandbox_timeout(),
            memory_limit_mb: default_memory_limit_mb(),
            cpu_time_secs: default_cpu_time_secs(),
            scratch_limit_mb: default_scratch_limit_mb(),
            max_concurrency: default_max_concurrency(),
            kill_grace_secs: default_kill_grace(),
            worker_binary: None,
            allow_in_process_fallback: false,
        }
    }
}

/// One LLM provider in the fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

const fn default_requests_per_minute() -> u32 {
    30
}

/// LLM generation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LlmConfig {
    /// Ordered fallback chain; the first provider whose key is present
    /// is primary.
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    /// Schema-validation retries per generation (on top of the first
    /// attempt).
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_temperature")]
    pub temperature: f64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        name: "primary".to_string(),
        base_url: "https://api.anthropic.com".to_string(),
        model: "claude-sonnet-4-20250514".to_string(),
        api_key_env: "ALPHALOOP_LLM_API_KEY".to_string(),
        requests_per_minute: default_requests_per_minute(),
    }]
}

const fn default_retry_max() -> u32 {
    3
}

const fn default_llm_timeout() -> u64 {
    60
}

const fn default_temperature() -> f64 {
    0.7
}

const fn default_max_tokens() -> u32 {
    1024
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            retry_max: default_retry_max(),
            timeout_secs: default_llm_timeout(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Champion promotion and anti-churn policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChampionPolicyConfig {
    /// Allowed drawdown worsening for a candidate (positive fraction).
    #[serde(default = "default_drawdown_tolerance")]
    pub drawdown_tolerance: f64,

    /// Allowed win-rate regression before the preservation check vetoes.
    #[serde(default = "default_win_rate_tolerance")]
    pub win_rate_tolerance: f64,

    /// Candidates below this trade count never become champion.
    #[serde(default = "default_min_trade_floor")]
    pub min_trade_floor: u64,

    /// Iterations over which champion updates are counted for churn.
    #[serde(default = "default_churn_window")]
    pub churn_window: u64,

    /// Sharpe margin at zero recent updates.
    #[serde(default = "default_base_margin")]
    pub base_margin: f64,

    /// Margin added per recent update inside the churn window.
    #[serde(default = "default_margin_step")]
    pub margin_step: f64,

    /// Clamp for the dynamic margin.
    #[serde(default = "default_margin_max")]
    pub margin_max: f64,

    /// Staleness count that triggers a cohort comparison.
    #[serde(default = "default_staleness_limit")]
    pub staleness_limit: u32,
}

const fn default_drawdown_tolerance() -> f64 {
    0.05
}

const fn default_win_rate_tolerance() -> f64 {
    0.10
}

const fn default_min_trade_floor() -> u64 {
    10
}

const fn default_churn_window() -> u64 {
    20
}

const fn default_base_margin() -> f64 {
    0.02
}

const fn default_margin_step() -> f64 {
    0.01
}

const fn default_margin_max() -> f64 {
    0.15
}

const fn default_staleness_limit() -> u32 {
    25
}

impl Default for ChampionPolicyConfig {
    fn default() -> Self {
        Self {
            drawdown_tolerance: default_drawdown_tolerance(),
            win_rate_tolerance: default_win_rate_tolerance(),
            min_trade_floor: default_min_trade_floor(),
            churn_window: default_churn_window(),
            base_margin: default_base_margin(),
            margin_step: default_margin_step(),
            margin_max: default_margin_max(),
            staleness_limit: default_staleness_limit(),
        }
    }
}

/// Factor-graph mutation scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MutationConfig {
    /// Generation depth below which expansion dominates.
    #[serde(default = "default_early_phase_end")]
    pub early_phase_end: u32,

    /// Generation depth at which refinement dominates.
    #[serde(default = "default_late_phase_start")]
    pub late_phase_start: u32,

    /// Added to the mutation rate when diversity drops below the floor.
    #[serde(default = "default_diversity_boost")]
    pub diversity_boost: f64,

    /// Diversity below this is considered low.
    #[serde(default = "default_diversity_floor")]
    pub diversity_floor: f64,

    /// Bound on the per-operator success-rate adjustment (multiplicative,
    /// symmetric).
    #[serde(default = "default_operator_adjust_bound")]
    pub operator_adjust_bound: f64,

    /// Minimum probability any operator keeps.
    #[serde(default = "default_operator_floor")]
    pub operator_floor: f64,

    /// Nodes a graph may not exceed through add mutations.
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

const fn default_early_phase_end() -> u32 {
    5
}

const fn default_late_phase_start() -> u32 {
    15
}

const fn default_diversity_boost() -> f64 {
    0.2
}

const fn default_diversity_floor() -> f64 {
    0.3
}

const fn default_operator_adjust_bound() -> f64 {
    0.2
}

const fn default_operator_floor() -> f64 {
    0.05
}

const fn default_max_nodes() -> usize {
    12
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            early_phase_end: default_early_phase_end(),
            late_phase_start: default_late_phase_start(),
            diversity_boost: default_diversity_boost(),
            diversity_floor: default_diversity_floor(),
            operator_adjust_bound: default_operator_adjust_bound(),
            operator_floor: default_operator_floor(),
            max_nodes: default_max_nodes(),
        }
    }
}

/// Rebalance cadence for the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

/// Backtest window and transaction-cost knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BacktestConfig {
    /// Commission fraction per side. Taiwan default.
    #[serde(default = "default_commission")]
    pub commission: f64,

    /// Securities transaction tax fraction, charged on sells. Taiwan
    /// default.
    #[serde(default = "default_tax")]
    pub tax: f64,

    #[serde(default)]
    pub rebalance: RebalanceFrequency,

    /// Requested simulation window; positions are row-filtered to it
    /// before simulation.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,

    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

const fn default_commission() -> f64 {
    0.001_425
}

const fn default_tax() -> f64 {
    0.003
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            commission: default_commission(),
            tax: default_tax(),
            rebalance: RebalanceFrequency::Daily,
            start_date: None,
            end_date: None,
        }
    }
}

/// Market-data gateway locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DataConfig {
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,

    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

fn default_manifest_path() -> String {
    ".alphaloop/manifest.yaml".to_string()
}

fn default_data_dir() -> String {
    ".alphaloop/data".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            manifest_path: default_manifest_path(),
            data_dir: default_data_dir(),
        }
    }
}

/// Feedback text shaping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FeedbackConfig {
    /// Recent Sharpe values quoted in the feedback text.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Hard cap on feedback length.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Window for plateau detection.
    #[serde(default = "default_plateau_window")]
    pub plateau_window: usize,
}

const fn default_top_k() -> usize {
    5
}

const fn default_max_chars() -> usize {
    2000
}

const fn default_plateau_window() -> usize {
    10
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_chars: default_max_chars(),
            plateau_window: default_plateau_window(),
        }
    }
}

/// Layer weights of the novelty score. The corpus disagrees on the
/// exact split, so it stays configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NoveltyConfig {
    #[serde(default = "default_weight_factor")]
    pub weight_factor_diversity: f64,

    #[serde(default = "default_weight_pattern")]
    pub weight_combination_pattern: f64,

    #[serde(default = "default_weight_complexity")]
    pub weight_logic_complexity: f64,
}

const fn default_weight_factor() -> f64 {
    0.4
}

const fn default_weight_pattern() -> f64 {
    0.3
}

const fn default_weight_complexity() -> f64 {
    0.3
}

impl Default for NoveltyConfig {
    fn default() -> Self {
        Self {
            weight_factor_diversity: default_weight_factor(),
            weight_combination_pattern: default_weight_pattern(),
            weight_logic_complexity: default_weight_complexity(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional log file; stdout only when unset.
    #[serde(default)]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}
