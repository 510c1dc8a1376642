//! Backtest output and the normalized metrics record derived from it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Summary statistics a backtest report must expose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub sharpe_ratio: f64,
    pub annual_return: f64,
    /// Negative fraction, e.g. -0.23 for a 23% peak-to-trough loss.
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub trade_count: u64,
    /// Average number of simultaneously held positions.
    pub position_count: f64,
}

/// Raw result of simulating a position matrix.
///
/// Opaque to the executor; the metrics extractor is the only consumer
/// that looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub dates: Vec<NaiveDate>,
    /// Per-date portfolio returns. May be empty if the simulator only
    /// produced an equity curve; extraction reconstructs it then.
    pub returns: Vec<f64>,
    /// Equity curve starting at 1.0.
    pub equity: Vec<f64>,
    pub stats: SummaryStats,
}

impl BacktestReport {
    /// Daily returns, reconstructed from equity when absent.
    pub fn returns_series(&self) -> Vec<f64> {
        if !self.returns.is_empty() {
            return self.returns.clone();
        }
        self.equity
            .windows(2)
            .filter(|w| w[0].abs() > f64::EPSILON)
            .map(|w| w[1] / w[0] - 1.0)
            .collect()
    }

    pub fn final_equity(&self) -> f64 {
        self.equity.last().copied().unwrap_or(1.0)
    }
}

/// Flat map of scalar performance numbers with a stable key set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub sharpe_ratio: f64,
    pub annual_return: f64,
    pub max_drawdown: f64,
    /// Defined iff `|max_drawdown| > 1e-10`; omitted otherwise, never
    /// NaN or infinity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calmar_ratio: Option<f64>,
    pub win_rate: f64,
    pub trade_count: u64,
    pub position_count: f64,
    pub execution_time_seconds: f64,
}

impl MetricsRecord {
    /// All mandatory scalars finite.
    pub fn is_finite(&self) -> bool {
        self.sharpe_ratio.is_finite()
            && self.annual_return.is_finite()
            && self.max_drawdown.is_finite()
            && self.win_rate.is_finite()
            && self.position_count.is_finite()
            && self.execution_time_seconds.is_finite()
            && self.calmar_ratio.is_none_or(f64::is_finite)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returns_reconstructed_from_equity() {
        let report = BacktestReport {
            dates: vec![],
            returns: vec![],
            equity: vec![1.0, 1.1, 1.045],
            stats: SummaryStats {
                sharpe_ratio: 0.0,
                annual_return: 0.0,
                max_drawdown: 0.0,
                win_rate: 0.0,
                trade_count: 0,
                position_count: 0.0,
            },
        };
        let rets = report.returns_series();
        assert_eq!(rets.len(), 2);
        assert!((rets[0] - 0.1).abs() < 1e-12);
        assert!((rets[1] + 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_calmar_omitted_from_serialization_when_absent() {
        let metrics = MetricsRecord {
            sharpe_ratio: 1.0,
            annual_return: 0.1,
            max_drawdown: 0.0,
            calmar_ratio: None,
            win_rate: 0.5,
            trade_count: 10,
            position_count: 12.0,
            execution_time_seconds: 1.5,
        };
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(!json.contains("calmar_ratio"));
    }
}
