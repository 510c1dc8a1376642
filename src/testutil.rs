//! Test support: canned data accessors, scripted LLM clients, and
//! record fixtures shared by unit and integration tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use crate::domain::error::{DataError, LlmError};
use crate::domain::models::artifact::{CodeStrategy, StrategyArtifact};
use crate::domain::models::champion::ChampionRecord;
use crate::domain::models::execution::ExecutionStatus;
use crate::domain::models::frame::Frame;
use crate::domain::models::metrics::MetricsRecord;
use crate::domain::models::record::{
    ClassificationLevel, IterationRecord, StrategyIdentity,
};
use crate::domain::ports::data_accessor::{
    DataAccessor, FieldCategory, FieldManifest, FieldValidation,
};
use crate::domain::ports::llm_client::{LlmClient, LlmRequest, LlmResponse};
use crate::services::generators::seed_graph;

/// The manifest every fixture shares.
pub fn manifest() -> FieldManifest {
    let mut fields = BTreeMap::new();
    fields.insert("close_adj".to_string(), FieldCategory::AdjustedPrice);
    fields.insert("open_adj".to_string(), FieldCategory::AdjustedPrice);
    fields.insert("close_raw".to_string(), FieldCategory::RawPrice);
    fields.insert("turnover".to_string(), FieldCategory::Liquidity);
    fields.insert("volume".to_string(), FieldCategory::Liquidity);
    fields.insert("pe_ratio".to_string(), FieldCategory::Fundamental);
    FieldManifest { fields }
}

/// Deterministic in-memory data gateway with synthetic Taiwan-like
/// series: drifting adjusted prices, ample turnover, a forbidden raw
/// price key.
pub struct StaticAccessor {
    manifest: FieldManifest,
    dates: Vec<NaiveDate>,
    symbols: Vec<String>,
}

impl StaticAccessor {
    /// `n_dates` trading days over `n_symbols` instruments with
    /// per-symbol drift so cross-sectional ranks differ.
    pub fn trending(n_dates: usize, n_symbols: usize) -> Self {
        let dates = (0..n_dates)
            .map(|i| {
                NaiveDate::from_ymd_opt(2022, 1, 3).unwrap() + chrono::Duration::days(i as i64)
            })
            .collect();
        let symbols = (0..n_symbols).map(|j| format!("23{j:02}")).collect();
        Self {
            manifest: manifest(),
            dates,
            symbols,
        }
    }

    fn price(&self, row: usize, col: usize) -> f64 {
        let drift = (col as f64 - self.symbols.len() as f64 / 2.0) * 0.002;
        let wiggle = ((row * 31 + col * 17) % 7) as f64 * 0.3;
        100.0 * (1.0 + drift).powi(row as i32) + wiggle
    }

    fn frame_for(&self, key: &str) -> Frame {
        let n = self.dates.len();
        let m = self.symbols.len();
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..m)
                    .map(|j| match key {
                        "turnover" => 2e8 + (j as f64) * 1e7,
                        "volume" => 5e6 + (j as f64) * 1e5,
                        "pe_ratio" => 12.0 + j as f64,
                        _ => self.price(i, j),
                    })
                    .collect()
            })
            .collect();
        Frame::from_rows(self.dates.clone(), self.symbols.clone(), rows)
            .expect("fixture axes are consistent")
    }
}

impl DataAccessor for StaticAccessor {
    fn get(&self, key: &str) -> Result<Frame, DataError> {
        if !self.manifest.contains(key) {
            return Err(DataError::UnknownField {
                field: key.to_string(),
                suggestion: self.manifest.suggest(key),
            });
        }
        Ok(self.frame_for(key))
    }

    fn validate_field(&self, key: &str) -> Result<FieldValidation, DataError> {
        if self.manifest.contains(key) {
            Ok(FieldValidation::Ok)
        } else if let Some(suggestion) = self.manifest.suggest(key) {
            Ok(FieldValidation::SuggestAlternative(suggestion))
        } else {
            Err(DataError::UnknownField {
                field: key.to_string(),
                suggestion: None,
            })
        }
    }

    fn manifest(&self) -> &FieldManifest {
        &self.manifest
    }
}

/// LLM double replying with a fixed sequence; repeats the last reply
/// once exhausted, and counts calls.
pub struct ScriptedLlm {
    replies: Vec<String>,
    calls: AtomicU32,
    fail_with: Option<LlmError>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<&str>) -> Self {
        Self {
            replies: replies.into_iter().map(String::from).collect(),
            calls: AtomicU32::new(0),
            fail_with: None,
        }
    }

    /// A client whose every call fails with the given error.
    pub fn failing(error: LlmError) -> Self {
        Self {
            replies: vec![],
            calls: AtomicU32::new(0),
            fail_with: Some(error),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn request(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(error) = &self.fail_with {
            return Err(error.clone());
        }
        let text = self
            .replies
            .get(n)
            .or_else(|| self.replies.last())
            .cloned()
            .ok_or_else(|| LlmError::InvalidResponse("no scripted reply".to_string()))?;
        Ok(LlmResponse {
            text,
            provider: "scripted".to_string(),
            model: "scripted-1".to_string(),
        })
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// LLM double that reads the requested template out of the prompt and
/// replies with a schema-valid parameter object for it.
#[derive(Default)]
pub struct TemplateAwareLlm {
    calls: AtomicU32,
}

impl TemplateAwareLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for TemplateAwareLlm {
    async fn request(&self, request: LlmRequest) -> Result<LlmResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = if request.prompt.contains(r#""template":"mean_reversion""#) {
            r#"{"window": 20, "portfolio_size": 6, "min_turnover": 60000000.0}"#
        } else if request.prompt.contains(r#""template":"breakout""#) {
            r#"{"window": 40, "portfolio_size": 6, "min_turnover": 50000000.0,
                "stop_fraction": 0.10}"#
        } else {
            r#"{"lookback": 30, "portfolio_size": 5, "min_turnover": 80000000.0,
                "stop_fraction": 0.08, "weighting": "equal"}"#
        };
        Ok(LlmResponse {
            text: text.to_string(),
            provider: "template-aware".to_string(),
            model: "scripted-1".to_string(),
        })
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// A CodeForm artifact around the given script text.
pub fn code_artifact(code_text: &str) -> StrategyArtifact {
    StrategyArtifact::Llm(CodeStrategy {
        code_text: code_text.to_string(),
        parameters: BTreeMap::new(),
        template_name: "momentum".to_string(),
        model_id: "test".to_string(),
    })
}

/// The seed factor graph as an artifact.
pub fn seed_artifact() -> StrategyArtifact {
    StrategyArtifact::FactorGraph(seed_graph("seed-test"))
}

/// Metrics fixture with healthy secondary metrics.
pub fn metrics_with_sharpe(sharpe: f64) -> MetricsRecord {
    MetricsRecord {
        sharpe_ratio: sharpe,
        annual_return: sharpe * 0.1,
        max_drawdown: -0.12,
        calmar_ratio: Some(sharpe * 0.1 / 0.12),
        win_rate: 0.55,
        trade_count: 40,
        position_count: 12.0,
        execution_time_seconds: 1.0,
    }
}

/// A level-2 graph-form iteration record.
pub fn iteration_record(iteration: u64, sharpe: f64) -> IterationRecord {
    IterationRecord {
        iteration_num: iteration,
        generation_method: crate::domain::models::artifact::GenerationMethod::FactorGraph,
        identity: StrategyIdentity::Graph {
            strategy_id: format!("fg-{iteration:05}"),
            generation_depth: 1,
        },
        execution: ExecutionStatus::Success {
            execution_time: 1.0,
        },
        metrics: Some(metrics_with_sharpe(sharpe)),
        classification_level: ClassificationLevel::Level2Valid,
        timestamp: Utc::now(),
        champion_updated: false,
        feedback_used: None,
        parent_reference: None,
    }
}

/// A champion record around the seed artifact.
pub fn champion_record(iteration: u64, sharpe: f64) -> ChampionRecord {
    champion_with_metrics(iteration, metrics_with_sharpe(sharpe))
}

/// A champion record around an arbitrary artifact.
pub fn champion_with_artifact(artifact: StrategyArtifact) -> ChampionRecord {
    ChampionRecord {
        iteration_num: 0,
        generation_method: artifact.method(),
        identity: StrategyIdentity::of(&artifact),
        metrics: metrics_with_sharpe(1.0),
        parameters: BTreeMap::new(),
        success_patterns: ChampionRecord::extract_patterns(&artifact),
        promoted_at: Utc::now(),
        staleness_counter: 0,
        artifact,
    }
}

fn champion_with_metrics(iteration: u64, metrics: MetricsRecord) -> ChampionRecord {
    let artifact = seed_artifact();
    ChampionRecord {
        iteration_num: iteration,
        generation_method: artifact.method(),
        identity: StrategyIdentity::of(&artifact),
        metrics,
        parameters: BTreeMap::new(),
        success_patterns: ChampionRecord::extract_patterns(&artifact),
        promoted_at: Utc::now(),
        staleness_counter: 0,
        artifact,
    }
}
