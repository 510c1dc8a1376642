//! Property tests over the record schema, the classifier, and calmar
//! extraction.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use alphaloop::domain::models::artifact::GenerationMethod;
use alphaloop::domain::models::config::MarketConfig;
use alphaloop::domain::models::execution::ExecutionStatus;
use alphaloop::domain::models::metrics::{BacktestReport, MetricsRecord, SummaryStats};
use alphaloop::domain::models::record::{
    ClassificationLevel, IterationRecord, StrategyIdentity,
};
use alphaloop::services::classifier::SuccessClassifier;
use alphaloop::services::metrics_extractor::MetricsExtractor;

fn metrics_strategy() -> impl Strategy<Value = MetricsRecord> {
    (
        -5.0f64..5.0,
        -1.0f64..2.0,
        -0.9f64..0.0,
        0.0f64..1.0,
        0u64..500,
        0.0f64..50.0,
        0.0f64..30.0,
    )
        .prop_map(
            |(sharpe, annual, dd, win, trades, positions, secs)| MetricsRecord {
                sharpe_ratio: sharpe,
                annual_return: annual,
                max_drawdown: dd,
                calmar_ratio: (dd.abs() > 1e-10).then(|| annual / dd.abs()),
                win_rate: win,
                trade_count: trades,
                position_count: positions,
                execution_time_seconds: secs,
            },
        )
}

fn record_strategy() -> impl Strategy<Value = IterationRecord> {
    (
        0u64..100_000,
        prop::bool::ANY,
        prop::option::of(metrics_strategy()),
        0i64..2_000_000_000,
        prop::bool::ANY,
    )
        .prop_map(|(iteration, is_llm, metrics, ts, updated)| {
            let (generation_method, identity) = if is_llm {
                (
                    GenerationMethod::Llm,
                    StrategyIdentity::Code {
                        code_text: "strategy t { positions = weight_equal(momentum(close_adj)); }"
                            .to_string(),
                    },
                )
            } else {
                (
                    GenerationMethod::FactorGraph,
                    StrategyIdentity::Graph {
                        strategy_id: format!("fg-{iteration:05}"),
                        generation_depth: (iteration % 40) as u32,
                    },
                )
            };
            let (execution, classification_level) = if metrics.is_some() {
                (
                    ExecutionStatus::Success {
                        execution_time: 1.0,
                    },
                    ClassificationLevel::Level2Valid,
                )
            } else {
                (
                    ExecutionStatus::ValidationFail {
                        violations: vec!["forbidden data key 'close_raw'".to_string()],
                    },
                    ClassificationLevel::Level0Failed,
                )
            };
            IterationRecord {
                iteration_num: iteration,
                generation_method,
                identity,
                execution,
                metrics,
                classification_level,
                timestamp: Utc.timestamp_opt(ts, 0).unwrap(),
                champion_updated: updated,
                feedback_used: None,
                parent_reference: None,
            }
        })
}

proptest! {
    /// Records survive a serialize, parse, re-serialize loop with
    /// identical bytes.
    #[test]
    fn record_roundtrip_is_byte_identical(record in record_strategy()) {
        let once = serde_json::to_string(&record).unwrap();
        let back: IterationRecord = serde_json::from_str(&once).unwrap();
        let twice = serde_json::to_string(&back).unwrap();
        prop_assert_eq!(once, twice);
        prop_assert!(back.check_invariants().is_ok());
    }

    /// Same inputs, same level, and levels follow the threshold rules.
    #[test]
    fn classifier_is_pure_and_ordered(metrics in metrics_strategy()) {
        let classifier = SuccessClassifier::new(&MarketConfig::default());
        let status = ExecutionStatus::Success { execution_time: 1.0 };
        let level = classifier.classify(&status, Some(&metrics));
        for _ in 0..5 {
            prop_assert_eq!(classifier.classify(&status, Some(&metrics)), level);
        }
        if metrics.trade_count == 0 {
            prop_assert_eq!(level, ClassificationLevel::Level1Executed);
        } else if metrics.sharpe_ratio >= 0.8 && metrics.max_drawdown.abs() <= 0.35 {
            prop_assert_eq!(level, ClassificationLevel::Level3Acceptable);
        } else {
            prop_assert_eq!(level, ClassificationLevel::Level2Valid);
        }
    }

    /// Calmar is defined iff drawdown is meaningfully nonzero, and
    /// equals annual over |drawdown| exactly.
    #[test]
    fn calmar_definition_holds(
        annual in -1.0f64..2.0,
        dd in prop_oneof![Just(0.0f64), -0.9f64..-0.001],
    ) {
        let report = BacktestReport {
            dates: vec![],
            returns: vec![0.01, -0.005, 0.002],
            equity: vec![1.0, 1.01, 1.005, 1.007],
            stats: SummaryStats {
                sharpe_ratio: 1.0,
                annual_return: annual,
                max_drawdown: dd,
                win_rate: 0.5,
                trade_count: 10,
                position_count: 5.0,
            },
        };
        let metrics = MetricsExtractor::extract(&report, 1.0).unwrap();
        if dd.abs() > 1e-10 {
            let calmar = metrics.calmar_ratio.unwrap();
            prop_assert!((calmar - annual / dd.abs()).abs() < 1e-12);
        } else {
            prop_assert!(metrics.calmar_ratio.is_none());
        }
    }
}
