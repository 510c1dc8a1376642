//! Static strategy validation. No execution happens here.
//!
//! Hard rules reject an artifact before any worker starts; soft rules
//! only warn. Rejections are two orders of magnitude cheaper than a
//! sandbox round-trip, so this runs first on every artifact.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::models::artifact::StrategyArtifact;
use crate::domain::models::config::RebalanceFrequency;
use crate::domain::ports::data_accessor::FieldManifest;
use crate::services::factor_registry::FactorRegistry;
use crate::services::script::{parse, Expr, Script, Stmt};

/// Raw-text tokens that always reject, whatever the parse outcome.
/// Scripts have no filesystem, network, subprocess, reflection, or
/// dynamic-evaluation primitives; these tokens appearing at all means
/// the text is not a strategy script.
const FORBIDDEN_OPERATIONS: &[&str] = &[
    "import", "exec", "eval", "open(", "subprocess", "socket", "getattr", "__",
];

/// Outcome of static validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    pub violations: Vec<String>,
}

impl ValidationReport {
    fn from_parts(warnings: Vec<String>, violations: Vec<String>) -> Self {
        Self {
            is_valid: violations.is_empty(),
            warnings,
            violations,
        }
    }
}

/// Static checker over strategy artifacts.
pub struct StrategyValidator {
    manifest: FieldManifest,
    rebalance: RebalanceFrequency,
}

impl StrategyValidator {
    pub fn new(manifest: FieldManifest, rebalance: RebalanceFrequency) -> Self {
        Self {
            manifest,
            rebalance,
        }
    }

    /// Validate one artifact against the hard and soft rule families.
    pub fn validate(
        &self,
        artifact: &StrategyArtifact,
        registry: &FactorRegistry,
    ) -> ValidationReport {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        if let Err(e) = artifact.validate_shape() {
            violations.push(e.to_string());
        }

        let params: Vec<(String, String, f64)> = match artifact {
            StrategyArtifact::Llm(code) => {
                self.check_forbidden_operations(&code.code_text, &mut violations);
                match parse(&code.code_text) {
                    Ok(script) => {
                        self.check_script(&script, registry, &mut violations);
                        collect_script_params(&script)
                    }
                    Err(e) => {
                        violations.push(format!("syntax error: {e}"));
                        Vec::new()
                    }
                }
            }
            StrategyArtifact::FactorGraph(graph) => {
                for node in &graph.dag.nodes {
                    match registry.get(&node.factor_name) {
                        None => violations
                            .push(format!("unknown factor '{}'", node.factor_name)),
                        Some(spec) => {
                            for pname in node.parameters.keys() {
                                if spec.param(pname).is_none() {
                                    violations.push(format!(
                                        "factor '{}' does not declare parameter '{pname}'",
                                        node.factor_name
                                    ));
                                }
                            }
                        }
                    }
                }
                for key in graph.dag.field_keys() {
                    self.check_field(key, &mut violations);
                }
                graph
                    .dag
                    .nodes
                    .iter()
                    .flat_map(|n| {
                        n.parameters
                            .iter()
                            .map(|(p, v)| (n.factor_name.clone(), p.clone(), *v))
                    })
                    .collect()
            }
        };

        if violations.is_empty() {
            self.soft_rules(&params, &mut warnings);
        }

        ValidationReport::from_parts(warnings, violations)
    }

    fn check_forbidden_operations(&self, text: &str, violations: &mut Vec<String>) {
        for token in FORBIDDEN_OPERATIONS {
            if text.contains(token) {
                violations.push(format!("forbidden operation '{token}'"));
            }
        }
    }

    fn check_field(&self, key: &str, violations: &mut Vec<String>) {
        match self.manifest.category(key) {
            Some(category) if category.is_forbidden() => {
                violations.push(format!(
                    "forbidden data key '{key}' (raw price series are not backtestable)"
                ));
            }
            Some(_) => {}
            None => {
                let mut message = format!("unknown data key '{key}'");
                if let Some(suggestion) = self.manifest.suggest(key) {
                    message.push_str(&format!(" (did you mean '{suggestion}'?)"));
                }
                violations.push(message);
            }
        }
    }

    /// Order-aware structural checks over a parsed script.
    fn check_script(
        &self,
        script: &Script,
        registry: &FactorRegistry,
        violations: &mut Vec<String>,
    ) {
        if !script.has_positions() {
            violations.push("script never assigns 'positions'".to_string());
        }
        let mut bound: HashSet<&str> = HashSet::new();
        for stmt in &script.statements {
            let expr = match stmt {
                Stmt::Let { expr, .. } | Stmt::Positions { expr } => expr,
            };
            self.check_expr(expr, &bound, registry, violations);
            if let Stmt::Let { name, .. } = stmt {
                bound.insert(name.as_str());
            }
        }
    }

    fn check_expr(
        &self,
        expr: &Expr,
        bound: &HashSet<&str>,
        registry: &FactorRegistry,
        violations: &mut Vec<String>,
    ) {
        match expr {
            Expr::Number(_) => {
                violations.push("bare number used as a frame input".to_string());
            }
            Expr::Ident(name) => {
                // References resolve to an earlier binding or a data key.
                if !bound.contains(name.as_str()) {
                    self.check_field(name, violations);
                }
            }
            Expr::Call {
                name,
                inputs,
                params,
            } => {
                match registry.get(name) {
                    None => violations.push(format!("unknown factor '{name}'")),
                    Some(spec) => {
                        if inputs.len() != spec.arity {
                            violations.push(format!(
                                "factor '{name}' expects {} inputs, got {}",
                                spec.arity,
                                inputs.len()
                            ));
                        }
                        for (pname, pvalue) in params {
                            match spec.param(pname) {
                                None => violations.push(format!(
                                    "factor '{name}' does not declare parameter '{pname}'"
                                )),
                                Some(ps) if *pvalue < ps.min || *pvalue > ps.max => {
                                    violations.push(format!(
                                        "factor '{name}' parameter '{pname}' = {pvalue} \
                                         outside [{}, {}]",
                                        ps.min, ps.max
                                    ));
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
                for input in inputs {
                    self.check_expr(input, bound, registry, violations);
                }
            }
        }
    }

    /// Risk-management and logical-consistency heuristics. Warn only.
    fn soft_rules(&self, params: &[(String, String, f64)], warnings: &mut Vec<String>) {
        for (factor, pname, value) in params {
            if factor == "trailing_stop"
                && pname == "fraction"
                && !(0.05..=0.20).contains(value)
            {
                warnings.push(format!(
                    "stop loss {value:.2} outside the 5-20% range typical for this market"
                ));
            }
            if factor == "select_top" && pname == "count" && !(5.0..=30.0).contains(value) {
                warnings.push(format!(
                    "portfolio of {value:.0} names outside the 5-30 range"
                ));
            }
        }

        let fast_signal = params
            .iter()
            .filter(|(f, p, _)| {
                matches!(
                    (f.as_str(), p.as_str()),
                    ("momentum", "lookback") | ("mean_reversion", "window")
                )
            })
            .map(|(_, _, v)| *v)
            .fold(f64::INFINITY, f64::min);
        let slow_overlay = params
            .iter()
            .filter(|(f, p, _)| {
                matches!(
                    (f.as_str(), p.as_str()),
                    ("trailing_stop", "window") | ("sma_cross", "slow")
                )
            })
            .map(|(_, _, v)| *v)
            .fold(0.0, f64::max);
        if fast_signal.is_finite() && slow_overlay > fast_signal * 6.0 {
            warnings.push(format!(
                "fast signal ({fast_signal:.0}d) paired with slow overlay \
                 ({slow_overlay:.0}d); signals may be stopped out by stale levels"
            ));
        }

        if self.rebalance == RebalanceFrequency::Daily {
            warnings.push(
                "daily rebalancing on a high-cost market; T+2 settlement makes full daily \
                 turnover capital-intensive"
                    .to_string(),
            );
            if fast_signal.is_finite() && fast_signal < 10.0 {
                warnings.push(format!(
                    "fast signal ({fast_signal:.0}d) with daily rebalancing compounds \
                     transaction costs"
                ));
            }
        }
    }
}

fn collect_script_params(script: &Script) -> Vec<(String, String, f64)> {
    let mut out = Vec::new();
    for stmt in &script.statements {
        let expr = match stmt {
            Stmt::Let { expr, .. } | Stmt::Positions { expr } => expr,
        };
        collect_expr_params(expr, &mut out);
    }
    out
}

fn collect_expr_params(expr: &Expr, out: &mut Vec<(String, String, f64)>) {
    if let Expr::Call {
        name,
        inputs,
        params,
    } = expr
    {
        for (pname, pvalue) in params {
            out.push((name.clone(), pname.clone(), *pvalue));
        }
        for input in inputs {
            collect_expr_params(input, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{code_artifact, manifest, seed_artifact};

    fn validator() -> StrategyValidator {
        StrategyValidator::new(manifest(), RebalanceFrequency::Weekly)
    }

    #[test]
    fn test_valid_script_passes() {
        let report = validator().validate(
            &code_artifact(
                "strategy t {\n\
                 let mom = momentum(close_adj, lookback = 20);\n\
                 let top = select_top(mom, count = 15);\n\
                 positions = weight_equal(top);\n\
                 }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(report.is_valid, "violations: {:?}", report.violations);
    }

    #[test]
    fn test_forbidden_raw_price_key_rejected() {
        let report = validator().validate(
            &code_artifact(
                "strategy t { positions = weight_equal(momentum(close_raw)); }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(!report.is_valid);
        assert!(report.violations[0].contains("forbidden data key"));
    }

    #[test]
    fn test_unknown_key_gets_suggestion() {
        let report = validator().validate(
            &code_artifact(
                "strategy t { positions = weight_equal(momentum(close_ad)); }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(!report.is_valid);
        assert!(report.violations.iter().any(|v| v.contains("close_adj")));
    }

    #[test]
    fn test_forbidden_operation_token_rejected() {
        let report = validator().validate(
            &code_artifact("strategy t { positions = import(close_adj); }"),
            &FactorRegistry::standard(),
        );
        assert!(!report.is_valid);
        assert!(report
            .violations
            .iter()
            .any(|v| v.contains("forbidden operation")));
    }

    #[test]
    fn test_use_before_definition_rejected() {
        let report = validator().validate(
            &code_artifact(
                "strategy t { positions = weight_equal(later); let later = momentum(close_adj); }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(!report.is_valid);
        assert!(report
            .violations
            .iter()
            .any(|v| v.contains("unknown data key 'later'")));
    }

    #[test]
    fn test_soft_rules_warn_but_pass() {
        let report = validator().validate(
            &code_artifact(
                "strategy t {\n\
                 let mom = momentum(close_adj, lookback = 20);\n\
                 let top = select_top(mom, count = 45);\n\
                 let stop = trailing_stop(close_adj, fraction = 0.25);\n\
                 positions = weight_equal(mask(top, stop));\n\
                 }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("stop loss")));
        assert!(report.warnings.iter().any(|w| w.contains("portfolio")));
    }

    #[test]
    fn test_daily_rebalance_warns_settlement() {
        let v = StrategyValidator::new(manifest(), RebalanceFrequency::Daily);
        let report = v.validate(
            &code_artifact(
                "strategy t { positions = weight_equal(momentum(close_adj, lookback = 20)); }",
            ),
            &FactorRegistry::standard(),
        );
        assert!(report.is_valid);
        assert!(report.warnings.iter().any(|w| w.contains("T+2")));
    }

    #[test]
    fn test_seed_graph_is_valid() {
        let report = validator().validate(&seed_artifact(), &FactorRegistry::standard());
        assert!(report.is_valid, "violations: {:?}", report.violations);
    }
}
