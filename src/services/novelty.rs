//! Three-layer novelty score between an artifact and prior artifacts.
//!
//! Layers: factor-diversity (Jaccard on factor names), combination
//! pattern (ordered bigram overlap), and logic complexity (structural
//! counters). The score is a diversity hint for the mutation scheduler
//! and monitoring; it never rejects a candidate.

use std::collections::{BTreeSet, HashMap};

use crate::domain::models::artifact::StrategyArtifact;
use crate::domain::models::config::NoveltyConfig;
use crate::services::script::parse;

/// Computes novelty scores in `[0, 1]`; 1 is fully novel.
#[derive(Debug, Clone)]
pub struct NoveltyAnalyzer {
    config: NoveltyConfig,
}

impl NoveltyAnalyzer {
    pub fn new(config: NoveltyConfig) -> Self {
        Self { config }
    }

    /// Novelty of `artifact` against a set of prior artifacts.
    ///
    /// The most similar prior dominates: novelty is measured against
    /// the nearest neighbor, not the average.
    pub fn score(&self, artifact: &StrategyArtifact, priors: &[StrategyArtifact]) -> f64 {
        if priors.is_empty() {
            return 1.0;
        }
        let features = Features::of(artifact);
        let nearest_similarity = priors
            .iter()
            .map(|prior| features.similarity(&Features::of(prior), &self.config))
            .fold(0.0_f64, f64::max);
        (1.0 - nearest_similarity).clamp(0.0, 1.0)
    }

    /// Mean pairwise novelty across a recent population; the diversity
    /// gauge the scheduler and monitoring consume.
    pub fn population_diversity(&self, population: &[StrategyArtifact]) -> f64 {
        if population.len() < 2 {
            return 1.0;
        }
        let features: Vec<Features> = population.iter().map(Features::of).collect();
        let mut total = 0.0;
        let mut pairs = 0usize;
        for i in 0..features.len() {
            for j in (i + 1)..features.len() {
                total += 1.0 - features[i].similarity(&features[j], &self.config);
                pairs += 1;
            }
        }
        total / pairs as f64
    }
}

/// Extracted comparison features of one artifact.
struct Features {
    factors: BTreeSet<String>,
    bigrams: BTreeSet<(String, String)>,
    complexity: f64,
}

impl Features {
    fn of(artifact: &StrategyArtifact) -> Self {
        let (names, complexity) = match artifact {
            StrategyArtifact::Llm(code) => match parse(&code.code_text) {
                Ok(script) => {
                    let stats = script.complexity();
                    let names: Vec<String> =
                        script.call_names().iter().map(ToString::to_string).collect();
                    (names, complexity_scalar(
                        stats.statements,
                        stats.max_call_depth,
                        stats.distinct_factors,
                        stats.variables,
                    ))
                }
                Err(_) => (Vec::new(), 0.0),
            },
            StrategyArtifact::FactorGraph(graph) => {
                let names: Vec<String> = graph
                    .dag
                    .factor_names()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                let distinct = names.iter().collect::<BTreeSet<_>>().len();
                let depth = graph_depth(graph);
                (
                    names.clone(),
                    complexity_scalar(graph.dag.nodes.len(), depth, distinct, graph.dag.nodes.len()),
                )
            }
        };
        let bigrams = names
            .windows(2)
            .map(|w| (w[0].clone(), w[1].clone()))
            .collect();
        Self {
            factors: names.into_iter().collect(),
            bigrams,
            complexity,
        }
    }

    fn similarity(&self, other: &Self, config: &NoveltyConfig) -> f64 {
        let factor_sim = jaccard(&self.factors, &other.factors);
        let pattern_sim = jaccard(&self.bigrams, &other.bigrams);
        let complexity_sim = 1.0 - (self.complexity - other.complexity).abs();
        let weight_sum = config.weight_factor_diversity
            + config.weight_combination_pattern
            + config.weight_logic_complexity;
        if weight_sum <= 0.0 {
            return 0.0;
        }
        (config.weight_factor_diversity * factor_sim
            + config.weight_combination_pattern * pattern_sim
            + config.weight_logic_complexity * complexity_sim)
            / weight_sum
    }
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

/// Normalized structural complexity in `[0, 1]`.
fn complexity_scalar(statements: usize, depth: usize, distinct: usize, variables: usize) -> f64 {
    let s = (statements as f64 / 12.0).min(1.0);
    let d = (depth as f64 / 5.0).min(1.0);
    let f = (distinct as f64 / 10.0).min(1.0);
    let v = (variables as f64 / 10.0).min(1.0);
    (s + d + f + v) / 4.0
}

/// Longest dependency chain in a factor graph.
fn graph_depth(graph: &crate::domain::models::artifact::GraphStrategy) -> usize {
    let Ok(order) = graph.dag.topo_order() else {
        return 0;
    };
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut max_depth = 0;
    for node in order {
        let d = node
            .depends_on()
            .filter_map(|dep| depth.get(dep).copied())
            .max()
            .map_or(1, |m| m + 1);
        depth.insert(node.node_id.as_str(), d);
        max_depth = max_depth.max(d);
    }
    max_depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{code_artifact, seed_artifact};

    fn analyzer() -> NoveltyAnalyzer {
        NoveltyAnalyzer::new(NoveltyConfig::default())
    }

    #[test]
    fn test_no_priors_fully_novel() {
        let a = seed_artifact();
        assert!((analyzer().score(&a, &[]) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_identical_artifact_not_novel() {
        let a = seed_artifact();
        let score = analyzer().score(&a, std::slice::from_ref(&a));
        assert!(score < 0.05, "identical artifact scored {score}");
    }

    #[test]
    fn test_different_factors_more_novel() {
        let momentum = code_artifact(
            "strategy a { positions = weight_equal(select_top(momentum(close_adj), count = 10)); }",
        );
        let reversal = code_artifact(
            "strategy b { positions = weight_by_score(mean_reversion(close_adj, window = 20)); }",
        );
        let same = analyzer().score(&momentum, std::slice::from_ref(&momentum));
        let diff = analyzer().score(&reversal, std::slice::from_ref(&momentum));
        assert!(diff > same);
        assert!(diff > 0.5);
    }

    #[test]
    fn test_population_diversity_bounds() {
        let a = seed_artifact();
        let b = code_artifact(
            "strategy b { positions = weight_by_score(mean_reversion(close_adj, window = 20)); }",
        );
        let d = analyzer().population_diversity(&[a.clone(), b]);
        assert!((0.0..=1.0).contains(&d));
        assert!((analyzer().population_diversity(&[a]) - 1.0).abs() < f64::EPSILON);
    }
}
