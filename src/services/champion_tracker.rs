//! Owner of the single best-strategy-so-far record.
//!
//! Applies the promotion policy (primary-metric improvement with a
//! dynamic anti-churn margin, drawdown tolerance, and a behavioral
//! preservation check), extracts success patterns on promotion, and
//! persists the record atomically via temp-file rename.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::domain::error::ChampionError;
use crate::domain::models::artifact::StrategyArtifact;
use crate::domain::models::champion::ChampionRecord;
use crate::domain::models::config::{ChampionPolicyConfig, MarketConfig};
use crate::domain::models::metrics::MetricsRecord;
use crate::domain::models::record::StrategyIdentity;

/// A candidate submitted for promotion.
#[derive(Debug, Clone)]
pub struct CandidateProposal {
    pub iteration_num: u64,
    pub metrics: MetricsRecord,
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub artifact: StrategyArtifact,
}

/// What `propose` decided and whether the decision reached disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromotionOutcome {
    pub accepted: bool,
    /// False when the accept succeeded in memory but persistence
    /// failed; the in-memory champion is kept and the write retried on
    /// the next promotion.
    pub persisted: bool,
}

/// Tracks and persists the champion record.
pub struct ChampionTracker {
    path: PathBuf,
    policy: ChampionPolicyConfig,
    /// `max(statistical, dynamic)`, kept alongside the two component
    /// thresholds, which are never conflated in outputs.
    promotion_threshold: f64,
    current: Option<ChampionRecord>,
    /// Iterations at which updates happened, for the churn margin.
    update_iterations: VecDeque<u64>,
}

impl ChampionTracker {
    /// Load the tracker, reading `champion.json` when present. A
    /// corrupt file is logged and treated as no champion.
    pub fn load(
        path: impl AsRef<Path>,
        policy: ChampionPolicyConfig,
        market: &MarketConfig,
    ) -> Self {
        let path = path.as_ref().to_path_buf();
        let current = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<ChampionRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "Champion file corrupt; starting without a champion");
                    None
                }
            },
            Err(_) => None,
        };
        Self {
            path,
            policy,
            promotion_threshold: market.promotion_threshold(),
            current,
            update_iterations: VecDeque::new(),
        }
    }

    /// Immutable snapshot of the current champion.
    pub fn current(&self) -> Option<&ChampionRecord> {
        self.current.as_ref()
    }

    /// The combined promotion bar, reported next to (never instead of)
    /// its two components.
    pub fn promotion_threshold(&self) -> f64 {
        self.promotion_threshold
    }

    /// The Sharpe margin a candidate must clear right now. Grows when
    /// updates have been frequent, shrinks back toward the base when
    /// they are sparse.
    pub fn current_margin(&self, iteration_num: u64) -> f64 {
        let window_start = iteration_num.saturating_sub(self.policy.churn_window);
        let recent_updates = self
            .update_iterations
            .iter()
            .filter(|i| **i >= window_start)
            .count() as f64;
        (self.policy.base_margin + self.policy.margin_step * recent_updates)
            .clamp(self.policy.base_margin, self.policy.margin_max)
    }

    /// Apply the promotion policy to a candidate.
    pub fn propose(&mut self, candidate: CandidateProposal) -> PromotionOutcome {
        let accepted = match &self.current {
            None => true,
            Some(current) => self.beats(current, &candidate),
        };
        if !accepted {
            // Staleness is counted once per iteration by
            // `note_iteration_without_update`, not here.
            return PromotionOutcome {
                accepted: false,
                persisted: true,
            };
        }

        let iteration_num = candidate.iteration_num;
        let record = self.build_record(candidate);
        self.current = Some(record);
        self.update_iterations.push_back(iteration_num);
        while self.update_iterations.len() > 64 {
            self.update_iterations.pop_front();
        }

        let persisted = match self.persist() {
            Ok(()) => true,
            Err(e) => {
                // Keep the in-memory champion; the next promotion
                // retries the write.
                tracing::warn!(error = %e, "Champion persisted in memory only");
                false
            }
        };
        PromotionOutcome {
            accepted: true,
            persisted,
        }
    }

    fn beats(&self, current: &ChampionRecord, candidate: &CandidateProposal) -> bool {
        let margin = self.current_margin(candidate.iteration_num);
        let m = &candidate.metrics;
        let c = &current.metrics;

        if !m.sharpe_ratio.is_finite() || m.sharpe_ratio <= c.sharpe_ratio + margin {
            return false;
        }
        // Drawdowns are non-positive; a candidate may be at most
        // `drawdown_tolerance` deeper than the incumbent.
        if m.max_drawdown.abs() > c.max_drawdown.abs() + self.policy.drawdown_tolerance {
            return false;
        }
        // Behavioral preservation: no regression on secondary metrics.
        if m.win_rate < c.win_rate - self.policy.win_rate_tolerance {
            return false;
        }
        if m.trade_count < self.policy.min_trade_floor {
            return false;
        }
        true
    }

    /// Count one iteration that produced no update; triggers the
    /// staleness-driven cohort comparison when due.
    ///
    /// `recent_candidate_sharpes` are the finite Sharpe values of the
    /// recent candidate cohort. A stale champion below the median of
    /// the cohort's top decile is demoted without needing a single
    /// better candidate.
    pub fn note_iteration_without_update(&mut self, recent_candidate_sharpes: &[f64]) {
        let Some(current) = &mut self.current else {
            return;
        };
        current.staleness_counter = current.staleness_counter.saturating_add(1);
        if current.staleness_counter < self.policy.staleness_limit {
            return;
        }
        let Some(bar) = top_decile_median(recent_candidate_sharpes) else {
            return;
        };
        if current.metrics.sharpe_ratio < bar {
            let sharpe = current.metrics.sharpe_ratio;
            self.force_demotion(&format!(
                "stale champion (sharpe {sharpe:.2}) below top-decile median ({bar:.2})"
            ));
        }
    }

    /// Drop the champion outright (anti-churn sweeps, staleness).
    pub fn force_demotion(&mut self, reason: &str) {
        tracing::warn!(reason, "Champion demoted");
        self.current = None;
        if self.path.exists() {
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(error = %e, "Failed to remove champion file after demotion");
            }
        }
    }

    fn build_record(&self, candidate: CandidateProposal) -> ChampionRecord {
        let promoted_at = match &self.current {
            // Monotonic across successive champions even if the wall
            // clock steps backwards.
            Some(previous) if previous.promoted_at > Utc::now() => previous.promoted_at,
            _ => Utc::now(),
        };
        ChampionRecord {
            iteration_num: candidate.iteration_num,
            generation_method: candidate.artifact.method(),
            identity: StrategyIdentity::of(&candidate.artifact),
            success_patterns: ChampionRecord::extract_patterns(&candidate.artifact),
            metrics: candidate.metrics,
            parameters: candidate.parameters,
            promoted_at,
            staleness_counter: 0,
            artifact: candidate.artifact,
        }
    }

    /// Serialize the whole record to a temp file, then rename into
    /// place.
    fn persist(&self) -> Result<(), ChampionError> {
        let Some(record) = &self.current else {
            return Ok(());
        };
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| ChampionError::PersistFailed(e.to_string()))?;
            }
        }
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| ChampionError::PersistFailed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)
                .map_err(|e| ChampionError::PersistFailed(e.to_string()))?;
            file.write_all(json.as_bytes())
                .map_err(|e| ChampionError::PersistFailed(e.to_string()))?;
            file.sync_all()
                .map_err(|e| ChampionError::PersistFailed(e.to_string()))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| ChampionError::PersistFailed(e.to_string()))
    }
}

/// Median of the top decile (by value) of a cohort; `None` when the
/// cohort is empty.
fn top_decile_median(sharpes: &[f64]) -> Option<f64> {
    let mut finite: Vec<f64> = sharpes.iter().copied().filter(|s| s.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }
    finite.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let decile_len = (finite.len().div_ceil(10)).max(1);
    let decile = &finite[..decile_len];
    Some(decile[decile.len() / 2])
}
