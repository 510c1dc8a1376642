//! Per-iteration outcome records, one line each in `history.jsonl`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::artifact::{GenerationMethod, StrategyArtifact};
use super::execution::ExecutionStatus;
use super::metrics::MetricsRecord;

/// Discrete outcome level of an iteration.
///
/// Ordering is meaningful: `Level3Acceptable > Level2Valid > ...`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ClassificationLevel {
    #[serde(rename = "level_0_failed")]
    Level0Failed,
    #[serde(rename = "level_1_executed")]
    Level1Executed,
    #[serde(rename = "level_2_valid")]
    Level2Valid,
    #[serde(rename = "level_3_acceptable")]
    Level3Acceptable,
}

impl ClassificationLevel {
    pub const ALL: [Self; 4] = [
        Self::Level0Failed,
        Self::Level1Executed,
        Self::Level2Valid,
        Self::Level3Acceptable,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Level0Failed => "level_0_failed",
            Self::Level1Executed => "level_1_executed",
            Self::Level2Valid => "level_2_valid",
            Self::Level3Acceptable => "level_3_acceptable",
        }
    }
}

impl std::fmt::Display for ClassificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the strategy an iteration produced; exactly one form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrategyIdentity {
    Code { code_text: String },
    Graph {
        strategy_id: String,
        generation_depth: u32,
    },
}

impl StrategyIdentity {
    pub fn of(artifact: &StrategyArtifact) -> Self {
        match artifact {
            StrategyArtifact::Llm(code) => Self::Code {
                code_text: code.code_text.clone(),
            },
            StrategyArtifact::FactorGraph(graph) => Self::Graph {
                strategy_id: graph.strategy_id.clone(),
                generation_depth: graph.generation_depth,
            },
        }
    }

    /// Whether the populated identity form matches the generation method.
    pub const fn matches_method(&self, method: GenerationMethod) -> bool {
        matches!(
            (self, method),
            (Self::Code { .. }, GenerationMethod::Llm)
                | (Self::Graph { .. }, GenerationMethod::FactorGraph)
        )
    }
}

/// One appended line of the iteration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration_num: u64,
    pub generation_method: GenerationMethod,
    #[serde(flatten)]
    pub identity: StrategyIdentity,
    pub execution: ExecutionStatus,
    /// Present iff `classification_level >= Level1Executed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsRecord>,
    pub classification_level: ClassificationLevel,
    pub timestamp: DateTime<Utc>,
    pub champion_updated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_reference: Option<String>,
}

impl IterationRecord {
    /// The record-level invariants (property P1 and the metrics/level
    /// coupling). Violations are construction bugs, surfaced in tests.
    pub fn check_invariants(&self) -> Result<(), String> {
        if !self.identity.matches_method(self.generation_method) {
            return Err(format!(
                "identity form does not match generation method {}",
                self.generation_method
            ));
        }
        match &self.identity {
            StrategyIdentity::Code { code_text } if code_text.is_empty() => {
                return Err("llm record with empty code text".into());
            }
            StrategyIdentity::Graph { strategy_id, .. } if strategy_id.is_empty() => {
                return Err("factor_graph record with empty strategy id".into());
            }
            _ => {}
        }
        let has_metrics = self.metrics.is_some();
        let expects_metrics = self.classification_level >= ClassificationLevel::Level1Executed;
        if has_metrics != expects_metrics {
            return Err(format!(
                "metrics presence ({has_metrics}) inconsistent with level {}",
                self.classification_level
            ));
        }
        Ok(())
    }
}
