//! Catalog of named factor functions grouped by category.
//!
//! Each factor is a pure function from input frames plus scalar
//! parameters to an output frame. Both execution forms evaluate through
//! this catalog: graph nodes reference factors by name, and the
//! strategy-script evaluator resolves call expressions here. The
//! registry is immutable after init.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::error::FrameError;
use crate::domain::models::artifact::FactorCategory;
use crate::domain::models::frame::Frame;

/// Errors raised while applying a factor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FactorEvalError {
    #[error("Factor '{factor}' expects {expected} inputs, got {got}")]
    Arity {
        factor: String,
        expected: usize,
        got: usize,
    },

    #[error("Factor '{factor}' parameter '{param}' = {value} outside [{min}, {max}]")]
    ParamOutOfRange {
        factor: String,
        param: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Factor evaluation failed: {0}")]
    Frame(#[from] FrameError),
}

/// Declared range of one scalar parameter.
///
/// Mutation ranges are factor-specific: the graph mutator perturbs
/// parameters within these bounds.
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
}

impl ParamSpec {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

type EvalFn = fn(&[Frame], &Params) -> Result<Frame, FactorEvalError>;

/// Resolved parameter lookup with spec defaults.
pub struct Params<'a> {
    factor: &'static str,
    specs: &'static [ParamSpec],
    values: &'a BTreeMap<String, f64>,
}

impl Params<'_> {
    /// Parameter value, validated against its declared range.
    pub fn get(&self, name: &str) -> Result<f64, FactorEvalError> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .expect("factor references an undeclared parameter");
        let value = self.values.get(name).copied().unwrap_or(spec.default);
        if value < spec.min || value > spec.max {
            return Err(FactorEvalError::ParamOutOfRange {
                factor: self.factor.to_string(),
                param: name.to_string(),
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(value)
    }

    fn get_usize(&self, name: &str) -> Result<usize, FactorEvalError> {
        let value = self.get(name)?.round().max(1.0);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let value = value as usize;
        Ok(value)
    }
}

/// One catalog entry.
#[derive(Clone, Copy)]
pub struct FactorSpec {
    pub name: &'static str,
    pub category: FactorCategory,
    /// Number of frame inputs.
    pub arity: usize,
    pub params: &'static [ParamSpec],
    /// Preferred data key wired to the first input when the mutator
    /// adds this factor without an upstream node.
    pub default_input: &'static str,
    eval: EvalFn,
}

impl FactorSpec {
    /// Apply the factor to already-resolved inputs.
    pub fn apply(
        &self,
        inputs: &[Frame],
        values: &BTreeMap<String, f64>,
    ) -> Result<Frame, FactorEvalError> {
        if inputs.len() != self.arity {
            return Err(FactorEvalError::Arity {
                factor: self.name.to_string(),
                expected: self.arity,
                got: inputs.len(),
            });
        }
        (self.eval)(
            inputs,
            &Params {
                factor: self.name,
                specs: self.params,
                values,
            },
        )
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }
}

impl std::fmt::Debug for FactorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorSpec")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

/// The immutable factor catalog.
#[derive(Debug)]
pub struct FactorRegistry {
    factors: Vec<FactorSpec>,
}

impl FactorRegistry {
    /// The standard catalog.
    pub fn standard() -> Self {
        Self {
            factors: vec![
                FactorSpec {
                    name: "momentum",
                    category: FactorCategory::Momentum,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "lookback",
                        min: 5.0,
                        max: 120.0,
                        default: 20.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_momentum,
                },
                FactorSpec {
                    name: "sma_cross",
                    category: FactorCategory::Momentum,
                    arity: 1,
                    params: &[
                        ParamSpec {
                            name: "fast",
                            min: 3.0,
                            max: 60.0,
                            default: 10.0,
                        },
                        ParamSpec {
                            name: "slow",
                            min: 20.0,
                            max: 240.0,
                            default: 60.0,
                        },
                    ],
                    default_input: "close_adj",
                    eval: eval_sma_cross,
                },
                FactorSpec {
                    name: "rsi_reversal",
                    category: FactorCategory::MeanReversion,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "period",
                        min: 7.0,
                        max: 30.0,
                        default: 14.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_rsi_reversal,
                },
                FactorSpec {
                    name: "mean_reversion",
                    category: FactorCategory::MeanReversion,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "window",
                        min: 10.0,
                        max: 60.0,
                        default: 20.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_mean_reversion,
                },
                FactorSpec {
                    name: "breakout",
                    category: FactorCategory::Breakout,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "window",
                        min: 20.0,
                        max: 120.0,
                        default: 55.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_breakout,
                },
                FactorSpec {
                    name: "volatility_inverse",
                    category: FactorCategory::Volatility,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "window",
                        min: 10.0,
                        max: 60.0,
                        default: 20.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_volatility_inverse,
                },
                FactorSpec {
                    name: "liquidity_filter",
                    category: FactorCategory::Liquidity,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "min_turnover",
                        min: 1e6,
                        max: 1e9,
                        default: 5e7,
                    }],
                    default_input: "turnover",
                    eval: eval_liquidity_filter,
                },
                FactorSpec {
                    name: "volume_filter",
                    category: FactorCategory::Liquidity,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "min_volume",
                        min: 1e4,
                        max: 1e8,
                        default: 1e6,
                    }],
                    default_input: "volume",
                    eval: eval_volume_filter,
                },
                FactorSpec {
                    name: "mask",
                    category: FactorCategory::Selection,
                    arity: 2,
                    params: &[],
                    default_input: "close_adj",
                    eval: eval_mask,
                },
                FactorSpec {
                    name: "combine",
                    category: FactorCategory::Selection,
                    arity: 2,
                    params: &[ParamSpec {
                        name: "weight",
                        min: 0.0,
                        max: 1.0,
                        default: 0.5,
                    }],
                    default_input: "close_adj",
                    eval: eval_combine,
                },
                FactorSpec {
                    name: "select_top",
                    category: FactorCategory::Selection,
                    arity: 1,
                    params: &[ParamSpec {
                        name: "count",
                        min: 1.0,
                        max: 50.0,
                        default: 15.0,
                    }],
                    default_input: "close_adj",
                    eval: eval_select_top,
                },
                FactorSpec {
                    name: "weight_equal",
                    category: FactorCategory::Weighting,
                    arity: 1,
                    params: &[],
                    default_input: "close_adj",
                    eval: eval_weight_equal,
                },
                FactorSpec {
                    name: "weight_by_score",
                    category: FactorCategory::Weighting,
                    arity: 1,
                    params: &[],
                    default_input: "close_adj",
                    eval: eval_weight_by_score,
                },
                FactorSpec {
                    name: "trailing_stop",
                    category: FactorCategory::Stop,
                    arity: 1,
                    params: &[
                        ParamSpec {
                            name: "fraction",
                            min: 0.03,
                            max: 0.30,
                            default: 0.10,
                        },
                        ParamSpec {
                            name: "window",
                            min: 20.0,
                            max: 120.0,
                            default: 60.0,
                        },
                    ],
                    default_input: "close_adj",
                    eval: eval_trailing_stop,
                },
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&FactorSpec> {
        self.factors.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn in_category(&self, category: FactorCategory) -> Vec<&FactorSpec> {
        self.factors
            .iter()
            .filter(|f| f.category == category)
            .collect()
    }

    pub fn all(&self) -> &[FactorSpec] {
        &self.factors
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.factors.iter().map(|f| f.name).collect()
    }
}

fn eval_momentum(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let lookback = p.get_usize("lookback")?;
    Ok(inputs[0].pct_change(lookback))
}

fn eval_sma_cross(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let fast = inputs[0].rolling_mean(p.get_usize("fast")?)?;
    let slow = inputs[0].rolling_mean(p.get_usize("slow")?)?;
    Ok(fast.zip_with(&slow, "sma_cross", |f, s| {
        if f.is_nan() || s.is_nan() {
            f64::NAN
        } else if f > s {
            1.0
        } else {
            0.0
        }
    })?)
}

fn eval_rsi_reversal(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let period = p.get_usize("period")?;
    let change = inputs[0].pct_change(1);
    let gains = change.map(|v| if v.is_nan() { f64::NAN } else { v.max(0.0) });
    let losses = change.map(|v| if v.is_nan() { f64::NAN } else { (-v).max(0.0) });
    let avg_gain = gains.rolling_mean(period)?;
    let avg_loss = losses.rolling_mean(period)?;
    // 50 - RSI: positive when oversold, negative when overbought.
    Ok(avg_gain.zip_with(&avg_loss, "rsi_reversal", |g, l| {
        if g.is_nan() || l.is_nan() {
            return f64::NAN;
        }
        let rsi = if l < 1e-12 {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + g / l)
        };
        50.0 - rsi
    })?)
}

fn eval_mean_reversion(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let window = p.get_usize("window")?;
    let mean = inputs[0].rolling_mean(window)?;
    let std = inputs[0].rolling_std(window)?;
    let z = inputs[0]
        .zip_with(&mean, "mean_reversion", |x, m| x - m)?
        .zip_with(&std, "mean_reversion", |d, s| {
            if s.is_nan() || s < 1e-12 {
                f64::NAN
            } else {
                d / s
            }
        })?;
    // Negated z-score: buy what fell below its mean.
    Ok(z.map(|v| -v))
}

fn eval_breakout(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let window = p.get_usize("window")?;
    let prior_high = inputs[0].rolling_max(window)?.shift(1);
    Ok(inputs[0].zip_with(&prior_high, "breakout", |x, h| {
        if x.is_nan() || h.is_nan() {
            f64::NAN
        } else if x >= h {
            1.0
        } else {
            0.0
        }
    })?)
}

fn eval_volatility_inverse(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let window = p.get_usize("window")?;
    let vol = inputs[0].pct_change(1).rolling_std(window)?;
    Ok(vol.map(|v| if v.is_nan() || v < 1e-12 { f64::NAN } else { 1.0 / v }))
}

fn eval_liquidity_filter(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let floor = p.get("min_turnover")?;
    Ok(inputs[0].map(|v| if v.is_finite() && v >= floor { 1.0 } else { 0.0 }))
}

fn eval_volume_filter(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let floor = p.get("min_volume")?;
    Ok(inputs[0].map(|v| if v.is_finite() && v >= floor { 1.0 } else { 0.0 }))
}

fn eval_mask(inputs: &[Frame], _p: &Params) -> Result<Frame, FactorEvalError> {
    Ok(inputs[0].mask(&inputs[1])?)
}

fn eval_combine(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let w = p.get("weight")?;
    Ok(inputs[0].zip_with(&inputs[1], "combine", |a, b| w * a + (1.0 - w) * b)?)
}

fn eval_select_top(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let count = p.get_usize("count")?;
    Ok(inputs[0].top_per_row(count))
}

fn eval_weight_equal(inputs: &[Frame], _p: &Params) -> Result<Frame, FactorEvalError> {
    Ok(inputs[0]
        .map(|v| if v.is_finite() && v > 0.0 { 1.0 } else { 0.0 })
        .row_normalize())
}

fn eval_weight_by_score(inputs: &[Frame], _p: &Params) -> Result<Frame, FactorEvalError> {
    Ok(inputs[0].row_normalize())
}

fn eval_trailing_stop(inputs: &[Frame], p: &Params) -> Result<Frame, FactorEvalError> {
    let fraction = p.get("fraction")?;
    let window = p.get_usize("window")?;
    let peak = inputs[0].rolling_max(window)?;
    Ok(inputs[0].zip_with(&peak, "trailing_stop", |x, pk| {
        if x.is_nan() || pk.is_nan() {
            f64::NAN
        } else if x >= pk * (1.0 - fraction) {
            1.0
        } else {
            0.0
        }
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn price_frame() -> Frame {
        let dates: Vec<NaiveDate> = (0..6)
            .map(|i| NaiveDate::from_ymd_opt(2023, 3, 1).unwrap() + chrono::Duration::days(i))
            .collect();
        Frame::from_rows(
            dates,
            vec!["2330".into(), "2317".into()],
            vec![
                vec![100.0, 50.0],
                vec![102.0, 49.0],
                vec![104.0, 48.0],
                vec![106.0, 47.0],
                vec![108.0, 46.0],
                vec![110.0, 45.0],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_standard_catalog_has_core_factors() {
        let registry = FactorRegistry::standard();
        for name in [
            "momentum",
            "breakout",
            "trailing_stop",
            "liquidity_filter",
            "select_top",
            "weight_equal",
        ] {
            assert!(registry.contains(name), "missing factor {name}");
        }
        assert!(!registry.in_category(FactorCategory::Momentum).is_empty());
    }

    #[test]
    fn test_momentum_sign() {
        let registry = FactorRegistry::standard();
        let spec = registry.get("momentum").unwrap();
        let mut params = BTreeMap::new();
        params.insert("lookback".to_string(), 5.0);
        let out = spec.apply(&[price_frame()], &params).unwrap();
        // Rising series positive, falling series negative.
        assert!(out.get(5, 0) > 0.0);
        assert!(out.get(5, 1) < 0.0);
    }

    #[test]
    fn test_param_out_of_range_rejected() {
        let registry = FactorRegistry::standard();
        let spec = registry.get("momentum").unwrap();
        let mut params = BTreeMap::new();
        params.insert("lookback".to_string(), 500.0);
        assert!(matches!(
            spec.apply(&[price_frame()], &params),
            Err(FactorEvalError::ParamOutOfRange { .. })
        ));
    }

    #[test]
    fn test_arity_mismatch_rejected() {
        let registry = FactorRegistry::standard();
        let spec = registry.get("mask").unwrap();
        assert!(matches!(
            spec.apply(&[price_frame()], &BTreeMap::new()),
            Err(FactorEvalError::Arity { .. })
        ));
    }

    #[test]
    fn test_weight_equal_rows_sum_to_one() {
        let registry = FactorRegistry::standard();
        let spec = registry.get("weight_equal").unwrap();
        let signal = price_frame().map(|v| if v > 60.0 { 1.0 } else { 0.0 });
        let weights = spec.apply(&[signal], &BTreeMap::new()).unwrap();
        let row_sum: f64 = (0..weights.n_symbols()).map(|c| weights.get(0, c)).sum();
        assert!((row_sum - 1.0).abs() < 1e-9);
    }
}
