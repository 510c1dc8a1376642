//! Evolutionary factor-graph mutator.
//!
//! Reads the current champion's graph and applies one of four
//! operators: add factor, remove factor, replace factor, or mutate
//! parameters. Operator probabilities shift by generation phase and by
//! measured diversity, with a multiplicative per-operator adjustment
//! from observed success rates. Every mutation yields a fresh DAG;
//! cycle creation is impossible by construction because new wires only
//! point at pre-existing nodes.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::domain::error::GenerationError;
use crate::domain::models::artifact::{
    FactorCategory, FactorDag, FactorNode, GenerationMethod, GraphStrategy, InputRef,
    StrategyArtifact,
};
use crate::domain::models::config::MutationConfig;
use crate::services::factor_registry::{FactorRegistry, FactorSpec};

use super::{seed_graph, GenerationContext, StrategyGenerator};

/// The four mutation operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    AddFactor,
    RemoveFactor,
    ReplaceFactor,
    MutateParameters,
}

impl MutationKind {
    const ALL: [Self; 4] = [
        Self::AddFactor,
        Self::RemoveFactor,
        Self::ReplaceFactor,
        Self::MutateParameters,
    ];
}

#[derive(Debug, Clone, Copy, Default)]
struct OpStats {
    attempts: u64,
    successes: u64,
}

impl OpStats {
    fn rate(self) -> Option<f64> {
        if self.attempts < 5 {
            None
        } else {
            Some(self.successes as f64 / self.attempts as f64)
        }
    }
}

/// The evolutionary generation path.
pub struct FactorGraphMutator {
    registry: Arc<FactorRegistry>,
    config: MutationConfig,
    rng: ChaCha8Rng,
    op_stats: HashMap<MutationKind, OpStats>,
    /// Which operator produced which strategy, for outcome feedback.
    lineage: HashMap<String, MutationKind>,
    node_counter: u64,
}

impl FactorGraphMutator {
    pub fn new(registry: Arc<FactorRegistry>, config: MutationConfig, seed: u64) -> Self {
        Self {
            registry,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
            op_stats: HashMap::new(),
            lineage: HashMap::new(),
            node_counter: 0,
        }
    }

    /// Feed an iteration outcome back into the operator schedule.
    pub fn record_result(&mut self, strategy_id: &str, success: bool) {
        if let Some(kind) = self.lineage.remove(strategy_id) {
            let stats = self.op_stats.entry(kind).or_default();
            stats.attempts += 1;
            if success {
                stats.successes += 1;
            }
        }
    }

    /// Operator distribution for this generation.
    fn weights(&self, depth: u32, diversity: f64) -> Vec<(MutationKind, f64)> {
        // Phase schedule: expansion early, balance mid, refinement late.
        let base: [(MutationKind, f64); 4] = if depth < self.config.early_phase_end {
            [
                (MutationKind::AddFactor, 0.50),
                (MutationKind::RemoveFactor, 0.10),
                (MutationKind::ReplaceFactor, 0.15),
                (MutationKind::MutateParameters, 0.25),
            ]
        } else if depth < self.config.late_phase_start {
            [
                (MutationKind::AddFactor, 0.30),
                (MutationKind::RemoveFactor, 0.15),
                (MutationKind::ReplaceFactor, 0.25),
                (MutationKind::MutateParameters, 0.30),
            ]
        } else {
            [
                (MutationKind::AddFactor, 0.10),
                (MutationKind::RemoveFactor, 0.15),
                (MutationKind::ReplaceFactor, 0.25),
                (MutationKind::MutateParameters, 0.50),
            ]
        };

        let mut weights: Vec<(MutationKind, f64)> = base.to_vec();

        // Low diversity temporarily raises the exploratory operators.
        if diversity < self.config.diversity_floor {
            for (kind, w) in &mut weights {
                if matches!(kind, MutationKind::AddFactor | MutationKind::ReplaceFactor) {
                    *w += self.config.diversity_boost / 2.0;
                }
            }
        }

        // Success-rate multiplier, bounded and floored.
        let bound = self.config.operator_adjust_bound;
        for (kind, w) in &mut weights {
            if let Some(rate) = self.op_stats.get(kind).copied().and_then(OpStats::rate) {
                let multiplier = (1.0 + (rate - 0.5) * 2.0 * bound)
                    .clamp(1.0 - bound, 1.0 + bound);
                *w *= multiplier;
            }
            *w = w.max(self.config.operator_floor);
        }

        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        for (_, w) in &mut weights {
            *w /= total;
        }
        weights
    }

    fn sample_kind(&mut self, depth: u32, diversity: f64) -> MutationKind {
        let weights = self.weights(depth, diversity);
        let mut roll: f64 = self.rng.gen();
        for (kind, w) in &weights {
            if roll < *w {
                return *kind;
            }
            roll -= w;
        }
        MutationKind::MutateParameters
    }

    fn fresh_node_id(&mut self, dag: &FactorDag, prefix: &str) -> String {
        loop {
            self.node_counter += 1;
            let id = format!("{prefix}{}", self.node_counter);
            if dag.node(&id).is_none() {
                return id;
            }
        }
    }

    fn apply(
        &mut self,
        kind: MutationKind,
        dag: &FactorDag,
    ) -> Result<FactorDag, GenerationError> {
        match kind {
            MutationKind::AddFactor => self.apply_add(dag),
            MutationKind::RemoveFactor => self.apply_remove(dag),
            MutationKind::ReplaceFactor => self.apply_replace(dag),
            MutationKind::MutateParameters => self.apply_mutate_params(dag),
        }
    }

    /// Insert a new factor node and mask it into the pre-terminal
    /// signal chain.
    fn apply_add(&mut self, dag: &FactorDag) -> Result<FactorDag, GenerationError> {
        if dag.nodes.len() + 2 > self.config.max_nodes {
            return Err(GenerationError::MutationRejected(
                "graph at maximum size".to_string(),
            ));
        }
        let mut categories = FactorCategory::SIGNAL_CATEGORIES.to_vec();
        categories.push(FactorCategory::Stop);
        let category = categories[self.rng.gen_range(0..categories.len())];
        let candidates = self.registry.in_category(category);
        if candidates.is_empty() {
            return Err(GenerationError::MutationRejected(format!(
                "no factors in category {category:?}"
            )));
        }
        let spec: FactorSpec = *candidates[self.rng.gen_range(0..candidates.len())];

        let terminals = dag.terminal_ids();
        let [terminal_id] = terminals.as_slice() else {
            return Err(GenerationError::MutationRejected(
                "graph lacks a single terminal".to_string(),
            ));
        };
        let terminal_id = (*terminal_id).to_string();
        let terminal = dag.node(&terminal_id).expect("terminal exists");
        let Some(InputRef::Node(pre_terminal)) = terminal.inputs.first().cloned() else {
            return Err(GenerationError::MutationRejected(
                "terminal is not fed by a node".to_string(),
            ));
        };

        let mut nodes = dag.nodes.clone();

        // Wire the new node's inputs to existing non-terminal nodes or
        // to its preferred data key.
        let wire_candidates: Vec<String> = nodes
            .iter()
            .map(|n| n.node_id.clone())
            .filter(|id| *id != terminal_id)
            .collect();
        let new_id = self.fresh_node_id(dag, "n");
        let mut inputs = Vec::with_capacity(spec.arity);
        for _ in 0..spec.arity {
            if !wire_candidates.is_empty() && self.rng.gen_bool(0.5) {
                let pick = self.rng.gen_range(0..wire_candidates.len());
                inputs.push(InputRef::Node(wire_candidates[pick].clone()));
            } else {
                inputs.push(InputRef::Field(spec.default_input.to_string()));
            }
        }
        nodes.push(FactorNode {
            node_id: new_id.clone(),
            factor_name: spec.name.to_string(),
            category: spec.category,
            parameters: spec
                .params
                .iter()
                .map(|p| (p.name.to_string(), p.default))
                .collect(),
            inputs,
        });

        let mask_id = self.fresh_node_id(dag, "m");
        nodes.push(FactorNode {
            node_id: mask_id.clone(),
            factor_name: "mask".to_string(),
            category: FactorCategory::Selection,
            parameters: std::collections::BTreeMap::new(),
            inputs: vec![InputRef::Node(pre_terminal), InputRef::Node(new_id)],
        });
        let terminal = nodes
            .iter_mut()
            .find(|n| n.node_id == terminal_id)
            .expect("terminal exists");
        terminal.inputs[0] = InputRef::Node(mask_id);

        Ok(FactorDag { nodes })
    }

    /// Delete a non-terminal node, rewiring its consumers to its first
    /// input.
    fn apply_remove(&mut self, dag: &FactorDag) -> Result<FactorDag, GenerationError> {
        let terminals = dag.terminal_ids();
        let candidates: Vec<&FactorNode> = dag
            .nodes
            .iter()
            .filter(|n| !terminals.contains(&n.node_id.as_str()) && !n.inputs.is_empty())
            .collect();
        if candidates.is_empty() || dag.nodes.len() <= 3 {
            return Err(GenerationError::MutationRejected(
                "no removable node".to_string(),
            ));
        }
        let victim = candidates[self.rng.gen_range(0..candidates.len())];
        let victim_id = victim.node_id.clone();
        let replacement = victim.inputs[0].clone();

        let mut nodes: Vec<FactorNode> = dag
            .nodes
            .iter()
            .filter(|n| n.node_id != victim_id)
            .cloned()
            .collect();
        for node in &mut nodes {
            for input in &mut node.inputs {
                if matches!(input, InputRef::Node(id) if *id == victim_id) {
                    *input = replacement.clone();
                }
            }
        }
        let dag = FactorDag { nodes };
        // Rewiring can orphan intermediate nodes into second terminals;
        // reject rather than emit an ambiguous graph.
        if dag.terminal_ids().len() != 1 {
            return Err(GenerationError::MutationRejected(
                "removal left consumers unsatisfiable".to_string(),
            ));
        }
        Ok(dag)
    }

    /// Swap a node for another factor of the same arity.
    fn apply_replace(&mut self, dag: &FactorDag) -> Result<FactorDag, GenerationError> {
        let terminals = dag.terminal_ids();
        let replaceable: Vec<usize> = dag
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                !terminals.contains(&n.node_id.as_str()) && n.factor_name != "mask"
            })
            .map(|(i, _)| i)
            .collect();
        if replaceable.is_empty() {
            return Err(GenerationError::MutationRejected(
                "no replaceable node".to_string(),
            ));
        }
        let idx = replaceable[self.rng.gen_range(0..replaceable.len())];
        let old = &dag.nodes[idx];
        let same_signature: Vec<&FactorSpec> = self
            .registry
            .all()
            .iter()
            .filter(|s| s.arity == old.inputs.len() && s.name != old.factor_name)
            .filter(|s| s.category != FactorCategory::Weighting)
            .collect();
        if same_signature.is_empty() {
            return Err(GenerationError::MutationRejected(format!(
                "no signature-compatible replacement for '{}'",
                old.factor_name
            )));
        }
        let spec = same_signature[self.rng.gen_range(0..same_signature.len())];

        let mut nodes = dag.nodes.clone();
        nodes[idx].factor_name = spec.name.to_string();
        nodes[idx].category = spec.category;
        nodes[idx].parameters = spec
            .params
            .iter()
            .map(|p| (p.name.to_string(), p.default))
            .collect();
        Ok(FactorDag { nodes })
    }

    /// Perturb one scalar parameter within its declared range.
    fn apply_mutate_params(&mut self, dag: &FactorDag) -> Result<FactorDag, GenerationError> {
        let candidates: Vec<usize> = dag
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                self.registry
                    .get(&n.factor_name)
                    .is_some_and(|s| !s.params.is_empty())
            })
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return Err(GenerationError::MutationRejected(
                "no parameterized node".to_string(),
            ));
        }
        let idx = candidates[self.rng.gen_range(0..candidates.len())];
        let node = &dag.nodes[idx];
        let spec = self
            .registry
            .get(&node.factor_name)
            .expect("candidate has a registry entry");
        let param = spec.params[self.rng.gen_range(0..spec.params.len())];
        let current = node
            .parameters
            .get(param.name)
            .copied()
            .unwrap_or(param.default);
        let mut value = param.clamp(current * self.rng.gen_range(0.7..1.3));
        if (value - current).abs() < 1e-9 {
            // Clamped back onto itself at a range edge; step inward.
            let direction = if current >= param.max { -1.0 } else { 1.0 };
            value = param.clamp(current + (param.max - param.min) * 0.05 * direction);
        }
        let mut nodes = dag.nodes.clone();
        nodes[idx].parameters.insert(param.name.to_string(), value);
        Ok(FactorDag { nodes })
    }
}

#[async_trait]
impl StrategyGenerator for FactorGraphMutator {
    fn method(&self) -> GenerationMethod {
        GenerationMethod::FactorGraph
    }

    async fn generate(
        &mut self,
        ctx: &GenerationContext<'_>,
    ) -> Result<StrategyArtifact, GenerationError> {
        // Template bootstrap: no champion graph to mutate means a seed
        // graph, never an LLM call.
        let parent = match ctx.champion.map(|c| &c.artifact) {
            Some(StrategyArtifact::FactorGraph(graph)) => graph,
            _ => {
                let seed = seed_graph(&format!("seed-{:05}", ctx.iteration_num));
                return Ok(StrategyArtifact::FactorGraph(seed));
            }
        };

        let mut last_error = None;
        for _ in 0..4 {
            let kind = self.sample_kind(parent.generation_depth, ctx.diversity);
            match self.apply(kind, &parent.dag) {
                Ok(dag) => {
                    let strategy_id = format!("fg-{:05}", ctx.iteration_num);
                    let child = GraphStrategy {
                        strategy_id: strategy_id.clone(),
                        parent_ids: vec![parent.strategy_id.clone()],
                        generation_depth: parent.generation_depth + 1,
                        dag,
                    };
                    child
                        .dag
                        .validate()
                        .map_err(|e| GenerationError::MutationRejected(e.to_string()))?;
                    self.lineage.insert(strategy_id, kind);
                    if self.lineage.len() > 256 {
                        // Outcomes for ancient strategies no longer
                        // matter; drop arbitrary overflow.
                        let stale: Vec<String> =
                            self.lineage.keys().take(64).cloned().collect();
                        for key in stale {
                            self.lineage.remove(&key);
                        }
                    }
                    return Ok(StrategyArtifact::FactorGraph(child));
                }
                Err(e) => {
                    tracing::debug!(operator = ?kind, error = %e, "Mutation rejected, resampling");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(GenerationError::NoParent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::champion_with_artifact;

    fn mutator(seed: u64) -> FactorGraphMutator {
        FactorGraphMutator::new(
            Arc::new(FactorRegistry::standard()),
            MutationConfig::default(),
            seed,
        )
    }

    fn graph_context(champion: &crate::domain::models::champion::ChampionRecord) -> GenerationContext<'_> {
        GenerationContext {
            iteration_num: 7,
            feedback: "",
            avoided_patterns: &[],
            champion: Some(champion),
            diversity: 1.0,
        }
    }

    #[tokio::test]
    async fn test_no_champion_emits_seed() {
        let mut m = mutator(1);
        let ctx = GenerationContext {
            iteration_num: 0,
            feedback: "",
            avoided_patterns: &[],
            champion: None,
            diversity: 1.0,
        };
        let artifact = m.generate(&ctx).await.unwrap();
        let StrategyArtifact::FactorGraph(graph) = artifact else {
            panic!("expected graph");
        };
        assert_eq!(graph.generation_depth, 0);
        assert!(graph.parent_ids.is_empty());
    }

    #[tokio::test]
    async fn test_mutation_links_lineage_and_depth() {
        let champion = champion_with_artifact(StrategyArtifact::FactorGraph(seed_graph("p")));
        let mut m = mutator(2);
        let artifact = m.generate(&graph_context(&champion)).await.unwrap();
        let StrategyArtifact::FactorGraph(child) = artifact else {
            panic!("expected graph");
        };
        assert_eq!(child.generation_depth, 1);
        assert_eq!(child.parent_ids, vec!["p".to_string()]);
        child.dag.validate().unwrap();
    }

    #[tokio::test]
    async fn test_mutations_remain_acyclic_over_many_generations() {
        let mut m = mutator(3);
        let mut champion =
            champion_with_artifact(StrategyArtifact::FactorGraph(seed_graph("p")));
        for i in 0..30 {
            let mut ctx = graph_context(&champion);
            ctx.iteration_num = i;
            let artifact = m.generate(&ctx).await.unwrap();
            let StrategyArtifact::FactorGraph(child) = &artifact else {
                panic!("expected graph");
            };
            child.dag.validate().unwrap();
            assert!(child.dag.nodes.len() <= MutationConfig::default().max_nodes);
            champion = champion_with_artifact(artifact);
        }
    }

    #[tokio::test]
    async fn test_deterministic_given_seed() {
        let champion = champion_with_artifact(StrategyArtifact::FactorGraph(seed_graph("p")));
        let a = mutator(42).generate(&graph_context(&champion)).await.unwrap();
        let b = mutator(42).generate(&graph_context(&champion)).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_weights_shift_by_phase() {
        let m = mutator(1);
        let early = m.weights(0, 1.0);
        let late = m.weights(30, 1.0);
        let add_early = early
            .iter()
            .find(|(k, _)| *k == MutationKind::AddFactor)
            .unwrap()
            .1;
        let add_late = late
            .iter()
            .find(|(k, _)| *k == MutationKind::AddFactor)
            .unwrap()
            .1;
        assert!(add_early > add_late);
        let mutate_late = late
            .iter()
            .find(|(k, _)| *k == MutationKind::MutateParameters)
            .unwrap()
            .1;
        assert!(mutate_late > add_late);
    }

    #[test]
    fn test_low_diversity_boosts_exploration() {
        let m = mutator(1);
        let normal = m.weights(8, 1.0);
        let starved = m.weights(8, 0.1);
        let explore = |ws: &[(MutationKind, f64)]| {
            ws.iter()
                .filter(|(k, _)| {
                    matches!(k, MutationKind::AddFactor | MutationKind::ReplaceFactor)
                })
                .map(|(_, w)| w)
                .sum::<f64>()
        };
        assert!(explore(&starved) > explore(&normal));
    }

    #[test]
    fn test_operator_floor_holds() {
        let mut m = mutator(1);
        // Starve one operator with failures.
        for i in 0..50 {
            let id = format!("s{i}");
            m.lineage.insert(id.clone(), MutationKind::AddFactor);
            m.record_result(&id, false);
        }
        let weights = m.weights(0, 1.0);
        for (_, w) in weights {
            assert!(w >= MutationConfig::default().operator_floor / 4.0);
        }
    }
}
