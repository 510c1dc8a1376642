//! Canonical strategy artifact: either executable strategy-script text
//! produced from an LLM-filled template, or a declarative factor DAG
//! produced by the evolutionary mutator.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::error::ArtifactError;

/// Which pipeline produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationMethod {
    /// Template + LLM-supplied parameters, materialized to script text.
    Llm,
    /// Evolutionary mutation of a factor graph.
    FactorGraph,
}

impl std::fmt::Display for GenerationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::FactorGraph => write!(f, "factor_graph"),
        }
    }
}

/// Coarse factor grouping used by the registry and the mutation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorCategory {
    Momentum,
    MeanReversion,
    Breakout,
    Volatility,
    Liquidity,
    Selection,
    Weighting,
    Stop,
}

impl FactorCategory {
    /// Categories a mutation may draw new factors from.
    pub const SIGNAL_CATEGORIES: [Self; 5] = [
        Self::Momentum,
        Self::MeanReversion,
        Self::Breakout,
        Self::Volatility,
        Self::Liquidity,
    ];
}

/// An input wire of a DAG node: a prior node's output or a raw data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputRef {
    /// Output of another node in the same graph.
    Node(String),
    /// A symbolic key resolved through the data accessor.
    Field(String),
}

/// One factor application inside a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorNode {
    pub node_id: String,
    pub factor_name: String,
    pub category: FactorCategory,
    /// Scalar parameters, keyed by the registry's parameter names.
    pub parameters: BTreeMap<String, f64>,
    pub inputs: Vec<InputRef>,
}

impl FactorNode {
    /// Node ids this node depends on (field inputs excluded).
    pub fn depends_on(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|i| match i {
            InputRef::Node(id) => Some(id.as_str()),
            InputRef::Field(_) => None,
        })
    }

    /// Data keys this node reads directly.
    pub fn field_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(|i| match i {
            InputRef::Field(key) => Some(key.as_str()),
            InputRef::Node(_) => None,
        })
    }
}

/// A directed acyclic graph of factor nodes terminating in a position
/// matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorDag {
    pub nodes: Vec<FactorNode>,
}

impl FactorDag {
    /// Structural soundness: unique ids, resolvable references, no
    /// cycles, at least one terminal node.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.node_id.as_str()) {
                return Err(ArtifactError::DuplicateNode(node.node_id.clone()));
            }
        }
        for node in &self.nodes {
            for dep in node.depends_on() {
                if !ids.contains(dep) {
                    return Err(ArtifactError::UnknownNodeRef {
                        node: node.node_id.clone(),
                        reference: dep.to_string(),
                    });
                }
            }
        }
        self.topo_order()?;
        if self.terminal_ids().is_empty() {
            return Err(ArtifactError::NoTerminalNode);
        }
        Ok(())
    }

    /// Nodes in dependency order; errors on cycles.
    pub fn topo_order(&self) -> Result<Vec<&FactorNode>, ArtifactError> {
        let by_id: HashMap<&str, &FactorNode> = self
            .nodes
            .iter()
            .map(|n| (n.node_id.as_str(), n))
            .collect();
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.node_id.as_str(), n.depends_on().count()))
            .collect();
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in node.depends_on() {
                consumers.entry(dep).or_default().push(node.node_id.as_str());
            }
        }

        // Kahn's algorithm; queue kept sorted so ordering is deterministic.
        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort_unstable();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(by_id[id]);
            if let Some(next) = consumers.get(id) {
                for &c in next {
                    let d = in_degree.get_mut(c).expect("consumer is a known node");
                    *d -= 1;
                    if *d == 0 {
                        ready.push(c);
                        ready.sort_unstable();
                    }
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(ArtifactError::CycleDetected);
        }
        Ok(order)
    }

    /// Ids of nodes no other node consumes.
    pub fn terminal_ids(&self) -> Vec<&str> {
        let consumed: HashSet<&str> = self
            .nodes
            .iter()
            .flat_map(FactorNode::depends_on)
            .collect();
        self.nodes
            .iter()
            .map(|n| n.node_id.as_str())
            .filter(|id| !consumed.contains(id))
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<&FactorNode> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    /// All factor names present in the graph, in node order.
    pub fn factor_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.factor_name.as_str()).collect()
    }

    /// All data keys the graph reads.
    pub fn field_keys(&self) -> HashSet<&str> {
        self.nodes.iter().flat_map(FactorNode::field_inputs).collect()
    }
}

/// Identity and provenance of an LLM-materialized script strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeStrategy {
    /// Strategy-script source; never mutated after construction.
    pub code_text: String,
    /// The validated parameter object the LLM supplied.
    pub parameters: BTreeMap<String, serde_json::Value>,
    pub template_name: String,
    pub model_id: String,
}

/// Identity and lineage of a factor-graph strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStrategy {
    pub strategy_id: String,
    /// Lineage relation only, never an ownership link.
    pub parent_ids: Vec<String>,
    pub generation_depth: u32,
    pub dag: FactorDag,
}

/// A runnable strategy in one of two canonical forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "generation_method", rename_all = "snake_case")]
pub enum StrategyArtifact {
    /// Executable strategy-script text.
    Llm(CodeStrategy),
    /// Declarative factor DAG.
    FactorGraph(GraphStrategy),
}

impl StrategyArtifact {
    pub const fn method(&self) -> GenerationMethod {
        match self {
            Self::Llm(_) => GenerationMethod::Llm,
            Self::FactorGraph(_) => GenerationMethod::FactorGraph,
        }
    }

    /// Enforce the construction invariants of whichever form this is.
    pub fn validate_shape(&self) -> Result<(), ArtifactError> {
        match self {
            Self::Llm(code) => {
                if code.code_text.trim().is_empty() {
                    return Err(ArtifactError::EmptyCode);
                }
                Ok(())
            }
            Self::FactorGraph(graph) => {
                if graph.strategy_id.trim().is_empty() {
                    return Err(ArtifactError::EmptyStrategyId);
                }
                graph.dag.validate()
            }
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            Self::Llm(code) => format!("llm:{}", code.template_name),
            Self::FactorGraph(graph) => format!(
                "graph:{} (depth {})",
                graph.strategy_id, graph.generation_depth
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, factor: &str, deps: &[&str]) -> FactorNode {
        FactorNode {
            node_id: id.to_string(),
            factor_name: factor.to_string(),
            category: FactorCategory::Momentum,
            parameters: BTreeMap::new(),
            inputs: deps.iter().map(|d| InputRef::Node((*d).to_string())).collect(),
        }
    }

    #[test]
    fn test_dag_topo_order_respects_dependencies() {
        let dag = FactorDag {
            nodes: vec![node("c", "f", &["a", "b"]), node("a", "f", &[]), node("b", "f", &["a"])],
        };
        let order: Vec<&str> = dag
            .topo_order()
            .unwrap()
            .iter()
            .map(|n| n.node_id.as_str())
            .collect();
        let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_dag_cycle_detected() {
        let dag = FactorDag {
            nodes: vec![node("a", "f", &["b"]), node("b", "f", &["a"])],
        };
        assert_eq!(dag.validate(), Err(ArtifactError::CycleDetected));
    }

    #[test]
    fn test_dag_unknown_ref() {
        let dag = FactorDag {
            nodes: vec![node("a", "f", &["ghost"])],
        };
        assert!(matches!(
            dag.validate(),
            Err(ArtifactError::UnknownNodeRef { .. })
        ));
    }

    #[test]
    fn test_dag_duplicate_id() {
        let dag = FactorDag {
            nodes: vec![node("a", "f", &[]), node("a", "g", &[])],
        };
        assert_eq!(
            dag.validate(),
            Err(ArtifactError::DuplicateNode("a".into()))
        );
    }

    #[test]
    fn test_empty_code_rejected() {
        let artifact = StrategyArtifact::Llm(CodeStrategy {
            code_text: "   ".into(),
            parameters: BTreeMap::new(),
            template_name: "momentum".into(),
            model_id: "test".into(),
        });
        assert_eq!(artifact.validate_shape(), Err(ArtifactError::EmptyCode));
    }

    #[test]
    fn test_generation_method_tagging() {
        let artifact = StrategyArtifact::FactorGraph(GraphStrategy {
            strategy_id: "fg-1".into(),
            parent_ids: vec![],
            generation_depth: 0,
            dag: FactorDag {
                nodes: vec![node("a", "momentum", &[])],
            },
        });
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(json.contains(r#""generation_method":"factor_graph""#));
        let back: StrategyArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method(), GenerationMethod::FactorGraph);
    }
}
