//! Daily portfolio simulator.
//!
//! Takes a (date × symbol) weight matrix and the adjusted price series,
//! applies weights with a one-day lag, charges commission on all
//! turnover and transaction tax on sells, and produces the backtest
//! report. Date-range selection is the caller's job: position rows are
//! pre-filtered before this runs, never passed as parameters.

use chrono::Datelike;
use thiserror::Error;

use crate::domain::error::FrameError;
use crate::domain::models::config::RebalanceFrequency;
use crate::domain::models::frame::Frame;
use crate::domain::models::metrics::{BacktestReport, SummaryStats};
use crate::services::metrics_extractor::stats;

/// Simulation failures; the worker maps these to runtime errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SimulationError {
    #[error("Position matrix and prices misaligned: {0}")]
    Misaligned(String),

    #[error("Simulation window too short ({0} rows)")]
    WindowTooShort(usize),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Transaction-cost and cadence knobs.
#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    /// Commission fraction charged on every traded notional.
    pub commission: f64,
    /// Tax fraction charged on sold notional.
    pub tax: f64,
    pub rebalance: RebalanceFrequency,
}

/// Simulate a weight matrix against adjusted prices.
pub fn simulate(
    positions: &Frame,
    prices: &Frame,
    cost: &CostModel,
) -> Result<BacktestReport, SimulationError> {
    if positions.n_dates() < 2 {
        return Err(SimulationError::WindowTooShort(positions.n_dates()));
    }
    if positions.symbols() != prices.symbols() {
        return Err(SimulationError::Misaligned(
            "symbol axes differ".to_string(),
        ));
    }
    // Prices restricted to the simulated dates.
    let first = positions.dates()[0];
    let last = positions.dates()[positions.n_dates() - 1];
    let prices = prices.filter_dates(first, last)?;
    if prices.dates() != positions.dates() {
        return Err(SimulationError::Misaligned(
            "price history does not cover every position date".to_string(),
        ));
    }

    let n = positions.n_dates();
    let m = positions.n_symbols();
    let asset_returns = prices.pct_change(1);

    let mut held = vec![0.0_f64; m];
    let mut returns = Vec::with_capacity(n);
    let mut equity = Vec::with_capacity(n);
    let mut trade_count = 0u64;
    let mut wealth = 1.0_f64;

    returns.push(0.0);
    equity.push(wealth);

    for t in 1..n {
        // Gross return from yesterday's holdings.
        let mut gross = 0.0;
        for j in 0..m {
            let r = asset_returns.get(t, j);
            if held[j] != 0.0 && r.is_finite() {
                gross += held[j] * r;
            }
        }

        // Rebalance into today's targets when the calendar says so.
        let mut costs = 0.0;
        if is_rebalance_date(positions.dates(), t, cost.rebalance) {
            let mut next = vec![0.0_f64; m];
            for j in 0..m {
                let w = positions.get(t, j);
                next[j] = if w.is_finite() { w } else { 0.0 };
            }
            for j in 0..m {
                let delta = next[j] - held[j];
                if delta.abs() > 1e-9 {
                    trade_count += 1;
                    costs += cost.commission * delta.abs();
                    if delta < 0.0 {
                        costs += cost.tax * delta.abs();
                    }
                }
            }
            held = next;
        }

        let net = gross - costs;
        wealth *= 1.0 + net;
        returns.push(net);
        equity.push(wealth);
    }

    let mut active_total = 0usize;
    for t in 0..n {
        active_total += positions.active_in_row(t);
    }
    let position_count = active_total as f64 / n as f64;

    let summary = SummaryStats {
        sharpe_ratio: stats::sharpe_ratio(&returns[1..]),
        annual_return: stats::annualized_return(&equity),
        max_drawdown: stats::max_drawdown(&equity),
        win_rate: stats::win_rate(&returns[1..]),
        trade_count,
        position_count,
    };

    Ok(BacktestReport {
        dates: positions.dates().to_vec(),
        returns,
        equity,
        stats: summary,
    })
}

/// Whether row `t` is a rebalance date under the given cadence. The
/// first row always is.
fn is_rebalance_date(
    dates: &[chrono::NaiveDate],
    t: usize,
    frequency: RebalanceFrequency,
) -> bool {
    if t == 0 {
        return true;
    }
    match frequency {
        RebalanceFrequency::Daily => true,
        RebalanceFrequency::Weekly => {
            dates[t].iso_week().week() != dates[t - 1].iso_week().week()
                || dates[t].iso_week().year() != dates[t - 1].iso_week().year()
        }
        RebalanceFrequency::Monthly => {
            dates[t].month() != dates[t - 1].month() || dates[t].year() != dates[t - 1].year()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::data_accessor::DataAccessor;
    use crate::testutil::StaticAccessor;
    use chrono::NaiveDate;

    fn cost() -> CostModel {
        CostModel {
            commission: 0.001_425,
            tax: 0.003,
            rebalance: RebalanceFrequency::Daily,
        }
    }

    fn dates(n: usize) -> Vec<NaiveDate> {
        (0..n)
            .map(|i| {
                NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + chrono::Duration::days(i as i64)
            })
            .collect()
    }

    #[test]
    fn test_flat_positions_flat_equity() {
        let d = dates(5);
        let symbols: Vec<String> = vec!["a".into(), "b".into()];
        let positions =
            Frame::from_rows(d.clone(), symbols.clone(), vec![vec![0.0, 0.0]; 5]).unwrap();
        let prices = Frame::from_rows(
            d,
            symbols,
            vec![
                vec![100.0, 50.0],
                vec![101.0, 51.0],
                vec![99.0, 50.0],
                vec![102.0, 52.0],
                vec![103.0, 53.0],
            ],
        )
        .unwrap();
        let report = simulate(&positions, &prices, &cost()).unwrap();
        assert_eq!(report.stats.trade_count, 0);
        assert!((report.final_equity() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_long_rising_asset_makes_money_net_of_costs() {
        let d = dates(6);
        let symbols: Vec<String> = vec!["a".into(), "b".into()];
        let mut weight_rows = vec![vec![1.0, 0.0]; 6];
        weight_rows[0] = vec![0.0, 0.0];
        let positions = Frame::from_rows(d.clone(), symbols.clone(), weight_rows).unwrap();
        let price_rows: Vec<Vec<f64>> =
            (0..6).map(|i| vec![100.0 * 1.01f64.powi(i), 50.0]).collect();
        let prices = Frame::from_rows(d, symbols, price_rows).unwrap();
        let report = simulate(&positions, &prices, &cost()).unwrap();
        assert!(report.final_equity() > 1.0);
        // One buy at t=1, no further trades (weights unchanged).
        assert_eq!(report.stats.trade_count, 1);
    }

    #[test]
    fn test_sell_charges_tax() {
        let d = dates(4);
        let symbols: Vec<String> = vec!["a".into()];
        let positions = Frame::from_rows(
            d.clone(),
            symbols.clone(),
            vec![vec![0.0], vec![1.0], vec![0.0], vec![0.0]],
        )
        .unwrap();
        let prices =
            Frame::from_rows(d, symbols, vec![vec![100.0]; 4]).unwrap();
        let report = simulate(&positions, &prices, &cost()).unwrap();
        // Flat prices: losses are exactly the costs. Buy pays
        // commission; sell pays commission + tax.
        let expected = (1.0 - 0.001_425) * (1.0 - 0.001_425 - 0.003);
        assert!((report.final_equity() - expected).abs() < 1e-9);
        assert_eq!(report.stats.trade_count, 2);
    }

    #[test]
    fn test_weekly_rebalance_trades_less() {
        let accessor = StaticAccessor::trending(40, 4);
        let prices = accessor.get("close_adj").unwrap();
        // Rotate weights every day to force turnover under daily cadence.
        let rows: Vec<Vec<f64>> = (0..40)
            .map(|i| {
                (0..4)
                    .map(|j| if j == i % 4 { 1.0 } else { 0.0 })
                    .collect()
            })
            .collect();
        let positions = Frame::from_rows(
            prices.dates().to_vec(),
            prices.symbols().to_vec(),
            rows,
        )
        .unwrap();

        let daily = simulate(&positions, &prices, &cost()).unwrap();
        let weekly = simulate(
            &positions,
            &prices,
            &CostModel {
                rebalance: RebalanceFrequency::Weekly,
                ..cost()
            },
        )
        .unwrap();
        assert!(weekly.stats.trade_count < daily.stats.trade_count);
    }

    #[test]
    fn test_all_report_rows_inside_window() {
        let accessor = StaticAccessor::trending(30, 3);
        let prices = accessor.get("close_adj").unwrap();
        let positions = prices.map(|_| 1.0 / 3.0);
        let start = prices.dates()[10];
        let end = prices.dates()[20];
        let filtered = positions.filter_dates(start, end).unwrap();
        let report = simulate(&filtered, &prices, &cost()).unwrap();
        assert!(report.dates.iter().all(|d| *d >= start && *d <= end));
    }
}
