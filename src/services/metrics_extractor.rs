//! Normalizes a raw backtest report into a flat metrics record.

use thiserror::Error;

use crate::domain::models::metrics::{BacktestReport, MetricsRecord};

/// Trading days per year on the Taiwan exchange.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Extraction failure: the report could not yield Sharpe and drawdown.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("metrics unavailable: {0}")]
    MetricsUnavailable(String),
}

/// Pure statistics shared with the simulator.
pub mod stats {
    use super::TRADING_DAYS_PER_YEAR;

    /// Annualized Sharpe ratio of a daily return series. Zero-variance
    /// series score 0, not NaN.
    pub fn sharpe_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std = var.sqrt();
        if std < 1e-12 {
            0.0
        } else {
            mean / std * TRADING_DAYS_PER_YEAR.sqrt()
        }
    }

    /// Geometric annualized return of an equity curve starting at 1.0.
    pub fn annualized_return(equity: &[f64]) -> f64 {
        if equity.len() < 2 {
            return 0.0;
        }
        let total = equity.last().copied().unwrap_or(1.0) / equity[0];
        if total <= 0.0 {
            return -1.0;
        }
        total.powf(TRADING_DAYS_PER_YEAR / (equity.len() - 1) as f64) - 1.0
    }

    /// Maximum peak-to-trough drawdown of an equity curve, as a
    /// non-positive fraction.
    pub fn max_drawdown(equity: &[f64]) -> f64 {
        let mut peak = f64::MIN;
        let mut worst = 0.0_f64;
        for &e in equity {
            peak = peak.max(e);
            if peak > 0.0 {
                worst = worst.min(e / peak - 1.0);
            }
        }
        worst
    }

    /// Fraction of active (nonzero) days that were positive.
    pub fn win_rate(returns: &[f64]) -> f64 {
        let active: Vec<f64> = returns
            .iter()
            .copied()
            .filter(|r| r.abs() > 1e-12)
            .collect();
        if active.is_empty() {
            return 0.0;
        }
        active.iter().filter(|r| **r > 0.0).count() as f64 / active.len() as f64
    }
}

/// Converts raw backtest reports into normalized metric records.
pub struct MetricsExtractor;

impl MetricsExtractor {
    /// Extract a metrics record, reconstructing the return series from
    /// the equity curve when the report lacks one.
    pub fn extract(
        report: &BacktestReport,
        execution_time_seconds: f64,
    ) -> Result<MetricsRecord, ExtractError> {
        let returns = report.returns_series();
        if returns.is_empty() {
            return Err(ExtractError::MetricsUnavailable(
                "report has neither returns nor a usable equity curve".to_string(),
            ));
        }

        let sharpe_ratio = if report.stats.sharpe_ratio.is_finite() {
            report.stats.sharpe_ratio
        } else {
            stats::sharpe_ratio(&returns)
        };
        let max_drawdown = if report.stats.max_drawdown.is_finite() {
            report.stats.max_drawdown
        } else {
            stats::max_drawdown(&report.equity)
        };
        if !sharpe_ratio.is_finite() || !max_drawdown.is_finite() {
            return Err(ExtractError::MetricsUnavailable(
                "sharpe or drawdown not finite".to_string(),
            ));
        }

        let annual_return = if report.stats.annual_return.is_finite() {
            report.stats.annual_return
        } else {
            stats::annualized_return(&report.equity)
        };
        let win_rate = if report.stats.win_rate.is_finite() {
            report.stats.win_rate
        } else {
            stats::win_rate(&returns)
        };

        // Calmar is defined iff drawdown is meaningfully nonzero;
        // otherwise absent, never NaN or infinity.
        let calmar_ratio = if max_drawdown.abs() > 1e-10 {
            Some(annual_return / max_drawdown.abs())
        } else {
            None
        };

        let record = MetricsRecord {
            sharpe_ratio,
            annual_return,
            max_drawdown,
            calmar_ratio,
            win_rate,
            trade_count: report.stats.trade_count,
            position_count: report.stats.position_count,
            execution_time_seconds,
        };
        if record.is_finite() {
            Ok(record)
        } else {
            Err(ExtractError::MetricsUnavailable(
                "non-finite scalar in extracted metrics".to_string(),
            ))
        }
    }
}
