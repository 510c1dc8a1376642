//! Maps execution outcomes and metrics to a discrete success level.

use crate::domain::models::config::MarketConfig;
use crate::domain::models::execution::ExecutionStatus;
use crate::domain::models::metrics::MetricsRecord;
use crate::domain::models::record::ClassificationLevel;

/// Pure classification function; same inputs, same level.
#[derive(Debug, Clone)]
pub struct SuccessClassifier {
    /// Market-aware Sharpe bar (distinct from the statistical bar the
    /// validation frameworks use downstream).
    dynamic_sharpe_threshold: f64,
    max_drawdown_bound: f64,
}

impl SuccessClassifier {
    pub fn new(market: &MarketConfig) -> Self {
        Self {
            dynamic_sharpe_threshold: market.dynamic_sharpe_threshold,
            max_drawdown_bound: market.max_drawdown_bound,
        }
    }

    /// Classify one iteration's outcome.
    pub fn classify(
        &self,
        execution: &ExecutionStatus,
        metrics: Option<&MetricsRecord>,
    ) -> ClassificationLevel {
        let Some(metrics) = metrics else {
            return ClassificationLevel::Level0Failed;
        };
        if !matches!(execution, ExecutionStatus::Success { .. }) {
            return ClassificationLevel::Level0Failed;
        }
        if !metrics.sharpe_ratio.is_finite() || metrics.trade_count == 0 {
            return ClassificationLevel::Level1Executed;
        }
        if metrics.sharpe_ratio >= self.dynamic_sharpe_threshold
            && metrics.max_drawdown.abs() <= self.max_drawdown_bound
        {
            ClassificationLevel::Level3Acceptable
        } else {
            ClassificationLevel::Level2Valid
        }
    }
}
