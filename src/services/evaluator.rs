//! Artifact evaluation: turns either artifact form into a position
//! matrix. This is the computational half of the worker pipeline.

use std::collections::HashMap;

use crate::domain::models::artifact::{FactorDag, InputRef, StrategyArtifact};
use crate::domain::models::frame::Frame;
use crate::domain::ports::data_accessor::DataAccessor;
use crate::services::factor_registry::FactorRegistry;
use crate::services::script::eval::{evaluate_script, EvalError};
use crate::services::script::parse;

/// Evaluate an artifact to its (unnormalized) position matrix.
pub fn evaluate_artifact(
    artifact: &StrategyArtifact,
    registry: &FactorRegistry,
    data: &dyn DataAccessor,
) -> Result<Frame, EvalError> {
    match artifact {
        StrategyArtifact::Llm(code) => {
            let script = parse(&code.code_text).map_err(|e| {
                // A script that fails to parse here slipped past
                // validation; surface it as an unknown-identifier class
                // of failure rather than panicking in the worker.
                EvalError::UnknownIdentifier(format!("unparseable script: {e}"))
            })?;
            evaluate_script(&script, registry, data)
        }
        StrategyArtifact::FactorGraph(graph) => evaluate_graph(&graph.dag, registry, data),
    }
}

/// Evaluate a factor DAG in topological order.
///
/// Each node receives its declared inputs from prior node outputs and
/// from the data accessor; the single terminal node's output is the
/// position matrix.
pub fn evaluate_graph(
    dag: &FactorDag,
    registry: &FactorRegistry,
    data: &dyn DataAccessor,
) -> Result<Frame, EvalError> {
    let order = dag
        .topo_order()
        .map_err(|e| EvalError::UnknownIdentifier(format!("invalid graph: {e}")))?;
    let mut outputs: HashMap<&str, Frame> = HashMap::new();
    for node in order {
        let spec = registry
            .get(&node.factor_name)
            .ok_or_else(|| EvalError::UnknownFactor(node.factor_name.clone()))?;
        let mut frames = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            match input {
                InputRef::Node(id) => {
                    let frame = outputs
                        .get(id.as_str())
                        .ok_or_else(|| EvalError::UnknownIdentifier(id.clone()))?;
                    frames.push(frame.clone());
                }
                InputRef::Field(key) => frames.push(data.get(key)?),
            }
        }
        let out = spec.apply(&frames, &node.parameters)?;
        outputs.insert(node.node_id.as_str(), out);
    }
    let terminals = dag.terminal_ids();
    match terminals.as_slice() {
        [single] => Ok(outputs
            .remove(*single)
            .expect("terminal node was evaluated")),
        _ => Err(EvalError::UnknownIdentifier(format!(
            "graph must have exactly one terminal node, found {}",
            terminals.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::generators::seed_graph;
    use crate::testutil::StaticAccessor;

    #[test]
    fn test_seed_graph_evaluates_to_weights() {
        let data = StaticAccessor::trending(80, 5);
        let registry = FactorRegistry::standard();
        let graph = seed_graph("seed-0");
        let positions = evaluate_graph(&graph.dag, &registry, &data).unwrap();
        let last = positions.n_dates() - 1;
        let sum: f64 = (0..positions.n_symbols())
            .map(|c| positions.get(last, c))
            .sum();
        // Terminal weighting node normalizes rows (or holds nothing).
        assert!(sum.abs() < 1e-9 || (sum - 1.0).abs() < 1e-9);
    }
}
