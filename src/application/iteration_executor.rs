//! One full iteration: choose a generator, generate, validate, run the
//! sandbox, score, classify, propose a champion update, append the
//! record.
//!
//! Every error below this level is converted into iteration-record
//! fields; the only error that escapes is a history append that failed
//! its retry, which is fatal for the loop. The append is atomic with
//! respect to the log: either a complete record lands or none does.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::domain::error::HistoryError;
use crate::domain::models::artifact::{GenerationMethod, StrategyArtifact};
use crate::domain::models::champion::SUCCESS_PATTERN_TOKENS;
use crate::domain::models::config::Config;
use crate::domain::models::execution::{ExecutionResult, ExecutionStatus};
use crate::domain::models::metrics::MetricsRecord;
use crate::domain::models::record::{
    ClassificationLevel, IterationRecord, StrategyIdentity,
};
use crate::domain::ports::data_accessor::FieldManifest;
use crate::domain::ports::llm_client::LlmClient;
use crate::domain::ports::monitor::{MonitorEvent, SharedMonitor, Stage};
use crate::services::champion_tracker::{CandidateProposal, ChampionTracker};
use crate::services::classifier::SuccessClassifier;
use crate::services::factor_registry::FactorRegistry;
use crate::services::feedback::FeedbackGenerator;
use crate::services::generators::{
    FactorGraphMutator, GenerationContext, StrategyGenerator, TemplateParameterGenerator,
};
use crate::services::history::IterationHistory;
use crate::services::metrics_extractor::MetricsExtractor;
use crate::services::novelty::NoveltyAnalyzer;
use crate::services::validator::StrategyValidator;
use crate::infrastructure::sandbox::SandboxExecutor;

/// Executes single iterations against the shared durable state.
pub struct IterationExecutor {
    config: Config,
    validator: StrategyValidator,
    classifier: SuccessClassifier,
    feedback: FeedbackGenerator,
    novelty: NoveltyAnalyzer,
    llm_generator: Option<TemplateParameterGenerator>,
    graph_mutator: FactorGraphMutator,
    sandbox: SandboxExecutor,
    history: IterationHistory,
    champion: ChampionTracker,
    monitor: SharedMonitor,
    /// Drives only the generator-selection coin; pinned seed, pinned
    /// method sequence.
    method_rng: ChaCha8Rng,
    /// Recent artifacts for the diversity gauge; in-memory only.
    recent_artifacts: VecDeque<StrategyArtifact>,
}

impl IterationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        manifest: FieldManifest,
        llm: Option<std::sync::Arc<dyn LlmClient>>,
        sandbox: SandboxExecutor,
        history: IterationHistory,
        champion: ChampionTracker,
        monitor: SharedMonitor,
    ) -> Self {
        let validator = StrategyValidator::new(manifest.clone(), config.backtest.rebalance);
        let classifier = SuccessClassifier::new(&config.market);
        let feedback = FeedbackGenerator::new(config.feedback.clone());
        let novelty = NoveltyAnalyzer::new(config.novelty.clone());
        let llm_generator = llm.map(|client| {
            TemplateParameterGenerator::new(client, config.llm.clone(), manifest)
        });
        if llm_generator.is_none() {
            tracing::warn!("No LLM client configured; running in factor-graph-only mode");
        }
        let graph_mutator = FactorGraphMutator::new(
            std::sync::Arc::new(FactorRegistry::standard()),
            config.mutation.clone(),
            config.engine.seed.wrapping_add(1),
        );
        let method_rng = ChaCha8Rng::seed_from_u64(config.engine.seed);
        Self {
            config,
            validator,
            classifier,
            feedback,
            novelty,
            llm_generator,
            graph_mutator,
            sandbox,
            history,
            champion,
            monitor,
            method_rng,
            recent_artifacts: VecDeque::new(),
        }
    }

    pub fn history(&self) -> &IterationHistory {
        &self.history
    }

    pub fn champion(&self) -> &ChampionTracker {
        &self.champion
    }

    /// Run iteration `iteration_num` end to end.
    ///
    /// Returns the appended record; the only `Err` is a fatal history
    /// failure.
    pub async fn run_iteration(
        &mut self,
        iteration_num: u64,
    ) -> Result<IterationRecord, HistoryError> {
        let recent = self.history.recent(self.config.engine.recent_window);
        let champion_snapshot = self.champion.current().cloned();
        let avoided = derive_avoided_patterns(&recent, champion_snapshot.as_ref());

        let feedback_text = self.feedback.generate(
            &recent,
            champion_snapshot.as_ref(),
            &avoided,
        );

        let diversity = self
            .novelty
            .population_diversity(self.recent_artifacts.make_contiguous());
        self.monitor.emit(MonitorEvent::Diversity(diversity));

        // The coin is tossed every iteration so a pinned seed pins the
        // method sequence regardless of which paths succeed.
        let coin: f64 = self.method_rng.gen();
        let prefer_llm = coin < self.config.engine.innovation_rate;

        let generation_started = Instant::now();
        let ctx = GenerationContext {
            iteration_num,
            feedback: &feedback_text,
            avoided_patterns: &avoided,
            champion: champion_snapshot.as_ref(),
            diversity,
        };
        let artifact = self.generate_with_fallback(prefer_llm, &ctx).await;
        self.monitor.emit(MonitorEvent::StageTiming {
            stage: Stage::Generation,
            seconds: generation_started.elapsed().as_secs_f64(),
        });

        let record = match artifact {
            None => {
                // Both paths failed; one iteration slot is consumed.
                self.build_record(
                    iteration_num,
                    GenerationMethod::FactorGraph,
                    StrategyIdentity::Graph {
                        strategy_id: format!("generation-failed-{iteration_num:05}"),
                        generation_depth: 0,
                    },
                    ExecutionStatus::RuntimeError {
                        error_kind: "generation".to_string(),
                        message: "both generation paths failed".to_string(),
                        stack_text: None,
                    },
                    None,
                    &feedback_text,
                    None,
                    false,
                )
            }
            Some(artifact) => {
                self.run_candidate(iteration_num, artifact, &feedback_text)
                    .await
            }
        };

        self.monitor
            .emit(MonitorEvent::IterationCompleted(record.classification_level));
        self.dump_failure_if_configured(&record);

        let persist_started = Instant::now();
        self.history.append(record.clone())?;
        self.monitor.emit(MonitorEvent::StageTiming {
            stage: Stage::Persistence,
            seconds: persist_started.elapsed().as_secs_f64(),
        });

        tracing::info!(
            iteration = iteration_num,
            method = %record.generation_method,
            level = %record.classification_level,
            champion_updated = record.champion_updated,
            "Iteration complete"
        );
        Ok(record)
    }

    /// Generate via the preferred path, falling through to the other
    /// on failure; `None` when both fail.
    async fn generate_with_fallback(
        &mut self,
        prefer_llm: bool,
        ctx: &GenerationContext<'_>,
    ) -> Option<StrategyArtifact> {
        let order: [GenerationMethod; 2] = if prefer_llm && self.llm_generator.is_some() {
            [GenerationMethod::Llm, GenerationMethod::FactorGraph]
        } else {
            [GenerationMethod::FactorGraph, GenerationMethod::Llm]
        };
        for method in order {
            let outcome = match method {
                GenerationMethod::Llm => match self.llm_generator.as_mut() {
                    Some(generator) => generator.generate(ctx).await,
                    None => continue,
                },
                GenerationMethod::FactorGraph => self.graph_mutator.generate(ctx).await,
            };
            match outcome {
                Ok(artifact) => return Some(artifact),
                Err(e) => {
                    tracing::warn!(
                        method = %method,
                        error = %e,
                        "Generation path failed; falling through"
                    );
                }
            }
        }
        None
    }

    /// Validate, execute, score, classify, and propose one artifact.
    async fn run_candidate(
        &mut self,
        iteration_num: u64,
        artifact: StrategyArtifact,
        feedback_text: &str,
    ) -> IterationRecord {
        let method = artifact.method();
        let identity = StrategyIdentity::of(&artifact);
        let parent_reference = match &artifact {
            StrategyArtifact::FactorGraph(graph) => graph.parent_ids.first().cloned(),
            StrategyArtifact::Llm(_) => None,
        };

        self.recent_artifacts.push_back(artifact.clone());
        while self.recent_artifacts.len() > self.config.engine.recent_window {
            self.recent_artifacts.pop_front();
        }

        // Static validation gates the sandbox: hard violations never
        // reach a worker.
        let validation_started = Instant::now();
        let registry = FactorRegistry::standard();
        let report = self.validator.validate(&artifact, &registry);
        self.monitor.emit(MonitorEvent::StageTiming {
            stage: Stage::Validation,
            seconds: validation_started.elapsed().as_secs_f64(),
        });
        for warning in &report.warnings {
            tracing::debug!(iteration = iteration_num, warning, "Validator warning");
        }
        if !report.is_valid {
            self.note_candidate_result(&artifact, false);
            return self.build_record(
                iteration_num,
                method,
                identity,
                ExecutionStatus::ValidationFail {
                    violations: report.violations,
                },
                None,
                feedback_text,
                parent_reference,
                false,
            );
        }

        let sandbox_started = Instant::now();
        let timeout = Duration::from_secs(self.config.sandbox.timeout_secs);
        let execution = match self.sandbox.execute(&artifact, timeout).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Sandbox infrastructure failure");
                ExecutionResult::RuntimeError {
                    error_kind: "sandbox_infrastructure".to_string(),
                    message: e.to_string(),
                    stack_text: None,
                }
            }
        };
        // Emissions stay off the worker's critical path; one sample
        // after reclamation.
        self.monitor.emit(MonitorEvent::StageTiming {
            stage: Stage::Sandbox,
            seconds: sandbox_started.elapsed().as_secs_f64(),
        });

        let scoring_started = Instant::now();
        let status = execution.status();
        let metrics = match &execution {
            ExecutionResult::Success {
                report,
                execution_time,
            } => match MetricsExtractor::extract(report, *execution_time) {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics extraction failed");
                    None
                }
            },
            _ => None,
        };
        let level = self.classifier.classify(&status, metrics.as_ref());
        self.monitor.emit(MonitorEvent::StageTiming {
            stage: Stage::Scoring,
            seconds: scoring_started.elapsed().as_secs_f64(),
        });

        self.note_candidate_result(&artifact, level >= ClassificationLevel::Level2Valid);

        let mut champion_updated = false;
        if level >= ClassificationLevel::Level2Valid {
            let metrics = metrics.clone().expect("level >= 2 implies metrics");
            let outcome = self.champion.propose(CandidateProposal {
                iteration_num,
                metrics: metrics.clone(),
                parameters: artifact_parameters(&artifact),
                artifact,
            });
            champion_updated = outcome.accepted;
            if outcome.accepted {
                self.monitor
                    .emit(MonitorEvent::ChampionSharpe(metrics.sharpe_ratio));
            }
        }
        if !champion_updated {
            let cohort: Vec<f64> = self
                .history
                .recent(self.config.engine.recent_window)
                .iter()
                .filter_map(|r| r.metrics.as_ref())
                .map(|m| m.sharpe_ratio)
                .collect();
            self.champion.note_iteration_without_update(&cohort);
        }

        self.build_record(
            iteration_num,
            method,
            identity,
            status,
            metrics,
            feedback_text,
            parent_reference,
            champion_updated,
        )
    }

    /// Feed the outcome back into the mutation schedule.
    fn note_candidate_result(&mut self, artifact: &StrategyArtifact, success: bool) {
        if let StrategyArtifact::FactorGraph(graph) = artifact {
            self.graph_mutator.record_result(&graph.strategy_id, success);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        iteration_num: u64,
        generation_method: GenerationMethod,
        identity: StrategyIdentity,
        execution: ExecutionStatus,
        metrics: Option<MetricsRecord>,
        feedback_text: &str,
        parent_reference: Option<String>,
        champion_updated: bool,
    ) -> IterationRecord {
        let classification_level = self.classifier.classify(&execution, metrics.as_ref());
        let record = IterationRecord {
            iteration_num,
            generation_method,
            identity,
            execution,
            metrics,
            classification_level,
            timestamp: Utc::now(),
            champion_updated,
            feedback_used: (!feedback_text.is_empty()).then(|| feedback_text.to_string()),
            parent_reference,
        };
        debug_assert!(record.check_invariants().is_ok(), "{:?}", record.check_invariants());
        record
    }

    /// Structured error dump for level-0 iterations, when configured.
    fn dump_failure_if_configured(&self, record: &IterationRecord) {
        let Some(dir) = &self.config.engine.failures_dir else {
            return;
        };
        if record.classification_level != ClassificationLevel::Level0Failed {
            return;
        }
        let path =
            std::path::Path::new(dir).join(format!("iteration-{:05}.json", record.iteration_num));
        let write = || -> std::io::Result<()> {
            std::fs::create_dir_all(dir)?;
            let json = serde_json::to_string_pretty(&record.execution)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, &path)
        };
        if let Err(e) = write() {
            tracing::warn!(error = %e, "Failed to write failure dump");
        }
    }
}

/// Flatten an artifact's parameters for the champion record.
fn artifact_parameters(artifact: &StrategyArtifact) -> BTreeMap<String, serde_json::Value> {
    match artifact {
        StrategyArtifact::Llm(code) => code.parameters.clone(),
        StrategyArtifact::FactorGraph(graph) => graph
            .dag
            .nodes
            .iter()
            .flat_map(|node| {
                node.parameters.iter().map(|(name, value)| {
                    (
                        format!("{}.{name}", node.node_id),
                        serde_json::json!(value),
                    )
                })
            })
            .collect(),
    }
}

/// Pattern tokens over-represented in recent failures, minus whatever
/// the champion demonstrably improved on.
fn derive_avoided_patterns(
    recent: &[IterationRecord],
    champion: Option<&crate::domain::models::champion::ChampionRecord>,
) -> Vec<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut failures = 0usize;
    for record in recent {
        if record.classification_level >= ClassificationLevel::Level2Valid {
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
    if failures < 3 {
        return Vec::new();
    }
    counts
        .into_iter()
        .filter(|(_, count)| *count * 2 > failures)
        .map(|(token, _)| token.to_string())
        .filter(|token| {
            // A pattern the champion carries is recommended material,
            // not avoided.
            champion.is_none_or(|c| !c.success_patterns.contains(token))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{champion_record, iteration_record};

    #[test]
    fn test_avoided_patterns_exclude_champion_strengths() {
        let mut failed = Vec::new();
        for i in 0..4 {
            let mut r = iteration_record(i, 0.1);
            r.classification_level = ClassificationLevel::Level0Failed;
            r.metrics = None;
            r.identity = StrategyIdentity::Code {
                code_text: "strategy t { let m = momentum(close_adj); let s = \
                            trailing_stop(close_adj); positions = weight_equal(mask(m, s)); }"
                    .to_string(),
            };
            r.generation_method = GenerationMethod::Llm;
            failed.push(r);
        }

        let avoided = derive_avoided_patterns(&failed, None);
        assert!(avoided.contains(&"momentum".to_string()));

        // The seed-graph champion carries momentum; it is no longer avoided.
        let champion = champion_record(0, 1.0);
        let avoided = derive_avoided_patterns(&failed, Some(&champion));
        assert!(!avoided.contains(&"momentum".to_string()));
    }

    #[test]
    fn test_artifact_parameters_flatten_graph_nodes() {
        let artifact = crate::testutil::seed_artifact();
        let params = artifact_parameters(&artifact);
        assert!(params.contains_key("mom.lookback"));
        assert!(params.contains_key("stop.fraction"));
    }
}
