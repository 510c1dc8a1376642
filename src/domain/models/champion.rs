//! The single best-strategy-so-far record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::{GenerationMethod, StrategyArtifact};
use super::metrics::MetricsRecord;
use super::record::StrategyIdentity;

/// Tokens recognized as success patterns inside champion artifacts.
pub const SUCCESS_PATTERN_TOKENS: &[&str] = &[
    "momentum",
    "breakout",
    "mean_reversion",
    "liquidity_filter",
    "volume_filter",
    "trailing_stop",
    "volatility",
    "rsi",
];

/// At most one live instance, owned by the champion tracker. Readers
/// receive immutable snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChampionRecord {
    pub iteration_num: u64,
    pub generation_method: GenerationMethod,
    #[serde(flatten)]
    pub identity: StrategyIdentity,
    pub metrics: MetricsRecord,
    /// Parameters of the winning artifact (template parameters for the
    /// LLM form; node parameters flattened for the graph form).
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// Recognized factor/filter/operation mentions, fed forward to the
    /// generators as recommended material.
    pub success_patterns: BTreeSet<String>,
    pub promoted_at: DateTime<Utc>,
    /// Iterations since the last champion update.
    pub staleness_counter: u32,
    /// Full artifact, kept so the graph mutator can read the champion's
    /// DAG without a side lookup.
    pub artifact: StrategyArtifact,
}

impl ChampionRecord {
    /// Scan an artifact for recognized success-pattern tokens.
    pub fn extract_patterns(artifact: &StrategyArtifact) -> BTreeSet<String> {
        let haystack = match artifact {
            StrategyArtifact::Llm(code) => code.code_text.clone(),
            StrategyArtifact::FactorGraph(graph) => {
                graph.dag.factor_names().join(" ")
            }
        };
        SUCCESS_PATTERN_TOKENS
            .iter()
            .filter(|token| haystack.contains(*token))
            .map(|token| (*token).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::artifact::CodeStrategy;

    #[test]
    fn test_pattern_extraction_from_code() {
        let artifact = StrategyArtifact::Llm(CodeStrategy {
            code_text: "strategy m { let a = momentum(close_adj, lookback = 20); \
                        let s = trailing_stop(close_adj, fraction = 0.1); }"
                .into(),
            parameters: BTreeMap::new(),
            template_name: "momentum".into(),
            model_id: "test".into(),
        });
        let patterns = ChampionRecord::extract_patterns(&artifact);
        assert!(patterns.contains("momentum"));
        assert!(patterns.contains("trailing_stop"));
        assert!(!patterns.contains("breakout"));
    }
}
