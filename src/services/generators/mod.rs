//! The two strategy sources behind a common generation interface.
//!
//! The iteration executor routes between them by the innovation rate;
//! either may fail, and failure falls through to the other path.

pub mod mutator;
pub mod template;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::error::GenerationError;
use crate::domain::models::artifact::{
    FactorCategory, FactorDag, FactorNode, GenerationMethod, GraphStrategy, InputRef,
    StrategyArtifact,
};
use crate::domain::models::champion::ChampionRecord;

pub use mutator::FactorGraphMutator;
pub use template::TemplateParameterGenerator;

/// Inputs shared by both generation paths.
#[derive(Debug, Clone, Copy)]
pub struct GenerationContext<'a> {
    pub iteration_num: u64,
    /// Feedback text from the previous iterations; may be empty.
    pub feedback: &'a str,
    pub avoided_patterns: &'a [String],
    pub champion: Option<&'a ChampionRecord>,
    /// Population diversity hint from the novelty analyzer.
    pub diversity: f64,
}

/// A strategy source emitting canonical artifacts.
#[async_trait]
pub trait StrategyGenerator: Send {
    fn method(&self) -> GenerationMethod;

    /// Produce one artifact, or a typed generation failure the caller
    /// can fall through on.
    async fn generate(
        &mut self,
        ctx: &GenerationContext<'_>,
    ) -> Result<StrategyArtifact, GenerationError>;
}

/// Bootstrap graph emitted when no champion exists: momentum plus
/// breakout entry, liquidity screen, trailing-stop overlay, equal
/// weights. The LLM is never consulted for this.
pub fn seed_graph(strategy_id: &str) -> GraphStrategy {
    fn node(
        id: &str,
        factor: &str,
        category: FactorCategory,
        params: &[(&str, f64)],
        inputs: Vec<InputRef>,
    ) -> FactorNode {
        FactorNode {
            node_id: id.to_string(),
            factor_name: factor.to_string(),
            category,
            parameters: params
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect::<BTreeMap<_, _>>(),
            inputs,
        }
    }
    let field = |key: &str| InputRef::Field(key.to_string());
    let by = |id: &str| InputRef::Node(id.to_string());

    GraphStrategy {
        strategy_id: strategy_id.to_string(),
        parent_ids: vec![],
        generation_depth: 0,
        dag: FactorDag {
            nodes: vec![
                node(
                    "mom",
                    "momentum",
                    FactorCategory::Momentum,
                    &[("lookback", 20.0)],
                    vec![field("close_adj")],
                ),
                node(
                    "brk",
                    "breakout",
                    FactorCategory::Breakout,
                    &[("window", 55.0)],
                    vec![field("close_adj")],
                ),
                node(
                    "liq",
                    "liquidity_filter",
                    FactorCategory::Liquidity,
                    &[("min_turnover", 5e7)],
                    vec![field("turnover")],
                ),
                node(
                    "entry",
                    "mask",
                    FactorCategory::Selection,
                    &[],
                    vec![by("mom"), by("brk")],
                ),
                node(
                    "screened",
                    "mask",
                    FactorCategory::Selection,
                    &[],
                    vec![by("entry"), by("liq")],
                ),
                node(
                    "top",
                    "select_top",
                    FactorCategory::Selection,
                    &[("count", 15.0)],
                    vec![by("screened")],
                ),
                node(
                    "stop",
                    "trailing_stop",
                    FactorCategory::Stop,
                    &[("fraction", 0.10), ("window", 60.0)],
                    vec![field("close_adj")],
                ),
                node(
                    "held",
                    "mask",
                    FactorCategory::Selection,
                    &[],
                    vec![by("top"), by("stop")],
                ),
                node(
                    "weights",
                    "weight_equal",
                    FactorCategory::Weighting,
                    &[],
                    vec![by("held")],
                ),
            ],
        },
    }
}
