//! Feedback text for the next generation call.
//!
//! A pure function of the recent history window, the current champion,
//! and the avoided-patterns list. Deterministic given inputs, no side
//! effects, capped length.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::domain::models::champion::{ChampionRecord, SUCCESS_PATTERN_TOKENS};
use crate::domain::models::config::FeedbackConfig;
use crate::domain::models::record::{
    ClassificationLevel, IterationRecord, StrategyIdentity,
};

/// Builds the feedback text consumed by both generators.
#[derive(Debug, Clone)]
pub struct FeedbackGenerator {
    config: FeedbackConfig,
}

impl FeedbackGenerator {
    pub fn new(config: FeedbackConfig) -> Self {
        Self { config }
    }

    /// Summarize recent outcomes into a short, language-neutral text.
    /// Empty history yields an empty string.
    pub fn generate(
        &self,
        recent: &[IterationRecord],
        champion: Option<&ChampionRecord>,
        avoided_patterns: &[String],
    ) -> String {
        if recent.is_empty() && champion.is_none() {
            return String::new();
        }
        let mut text = String::new();

        let mut sharpes: Vec<f64> = recent
            .iter()
            .filter_map(|r| r.metrics.as_ref())
            .map(|m| m.sharpe_ratio)
            .collect();
        sharpes.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        if !sharpes.is_empty() {
            let top: Vec<String> = sharpes
                .iter()
                .take(self.config.top_k)
                .map(|s| format!("{s:.2}"))
                .collect();
            let _ = writeln!(text, "Recent top Sharpe values: {}.", top.join(", "));
        }

        if let Some(champion) = champion {
            let _ = writeln!(
                text,
                "Current champion: Sharpe {:.2}, max drawdown {:.1}%, {} trades.",
                champion.metrics.sharpe_ratio,
                champion.metrics.max_drawdown * 100.0,
                champion.metrics.trade_count,
            );
            if !champion.parameters.is_empty() {
                let params: Vec<String> = champion
                    .parameters
                    .iter()
                    .take(6)
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect();
                let _ = writeln!(text, "Champion parameters: {}.", params.join(", "));
            }
            if !champion.success_patterns.is_empty() {
                let patterns: Vec<&str> = champion
                    .success_patterns
                    .iter()
                    .map(String::as_str)
                    .collect();
                let _ = writeln!(
                    text,
                    "Patterns that improved results (prefer these): {}.",
                    patterns.join(", ")
                );
            }
        }

        let avoid = self.failure_patterns(recent, avoided_patterns);
        if !avoid.is_empty() {
            let _ = writeln!(text, "Avoid these patterns: {}.", avoid.join(", "));
        }

        if let Some(window) = self.plateau(recent) {
            let _ = writeln!(
                text,
                "Sharpe has plateaued over the last {window} iterations; try a different \
                 factor mix."
            );
        }

        text.truncate(self.config.max_chars);
        text
    }

    /// Pattern tokens over-represented in recent failures, merged with
    /// the caller-supplied avoided list. Tokens the champion carries
    /// are recommended, never avoided.
    fn failure_patterns(
        &self,
        recent: &[IterationRecord],
        avoided_patterns: &[String],
    ) -> Vec<String> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        let mut failures = 0usize;
        for record in recent {
            if record.classification_level > ClassificationLevel::Level1Executed {
                continue;
            }
            if let StrategyIdentity::Code { code_text } = &record.identity {
                failures += 1;
                for token in SUCCESS_PATTERN_TOKENS {
                    if code_text.contains(token) {
                        *counts.entry(token).or_default() += 1;
                    }
                }
            }
        }
        let mut avoid: Vec<String> = avoided_patterns.to_vec();
        if failures >= 2 {
            for (token, count) in counts {
                if count * 2 >= failures && !avoid.iter().any(|a| a == token) {
                    avoid.push(token.to_string());
                }
            }
        }
        avoid
    }

    /// Detect a flat best-Sharpe across the two halves of the plateau
    /// window.
    fn plateau(&self, recent: &[IterationRecord]) -> Option<usize> {
        let window = self.config.plateau_window;
        if recent.len() < window || window < 4 {
            return None;
        }
        let tail = &recent[recent.len() - window..];
        let best = |records: &[IterationRecord]| -> Option<f64> {
            records
                .iter()
                .filter_map(|r| r.metrics.as_ref())
                .map(|m| m.sharpe_ratio)
                .fold(None, |acc: Option<f64>, s| {
                    Some(acc.map_or(s, |a| a.max(s)))
                })
        };
        let first = best(&tail[..window / 2])?;
        let second = best(&tail[window / 2..])?;
        if (second - first).abs() <= 0.05 * first.abs().max(0.1) {
            Some(window)
        } else {
            None
        }
    }
}
