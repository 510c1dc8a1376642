//! The strategy-script form of a CodeForm artifact.
//!
//! A deterministic materializer emits this text from a template plus
//! LLM-validated parameters; the LLM itself never writes it. The parser
//! doubles as the validator's "parses as a legal strategy function"
//! check, and the evaluator is the worker's CodeForm pipeline.
//!
//! ```text
//! strategy tw_momentum {
//!     let mom = momentum(close_adj, lookback = 20);
//!     let liq = liquidity_filter(turnover, min_turnover = 50000000);
//!     let sig = mask(mom, liq);
//!     let top = select_top(sig, count = 15);
//!     positions = weight_equal(top);
//! }
//! ```

pub mod eval;
pub mod parser;

use std::collections::BTreeSet;

pub use eval::evaluate_script;
pub use parser::{parse, ScriptError};

/// A parsed strategy script.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub name: String,
    pub statements: Vec<Stmt>,
}

/// One statement of a script body.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `let name = expr;`
    Let { name: String, expr: Expr },
    /// `positions = expr;`: the terminal position matrix.
    Positions { expr: Expr },
}

/// An expression: a factor call, a reference, or a bare number.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Call {
        name: String,
        /// Positional frame inputs.
        inputs: Vec<Expr>,
        /// Named scalar parameters.
        params: Vec<(String, f64)>,
    },
    /// A let binding or a data field key.
    Ident(String),
    Number(f64),
}

/// Structural complexity counters consumed by the novelty analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComplexityStats {
    pub statements: usize,
    pub max_call_depth: usize,
    pub distinct_factors: usize,
    pub variables: usize,
}

impl Script {
    /// Identifiers read but never bound: the data field keys.
    pub fn referenced_fields(&self) -> BTreeSet<&str> {
        let bound: BTreeSet<&str> = self
            .statements
            .iter()
            .filter_map(|s| match s {
                Stmt::Let { name, .. } => Some(name.as_str()),
                Stmt::Positions { .. } => None,
            })
            .collect();
        let mut fields = BTreeSet::new();
        for stmt in &self.statements {
            let expr = match stmt {
                Stmt::Let { expr, .. } | Stmt::Positions { expr } => expr,
            };
            collect_idents(expr, &mut |id| {
                if !bound.contains(id) {
                    fields.insert(id);
                }
            });
        }
        fields
    }

    /// Factor names invoked anywhere in the script, in call order.
    pub fn call_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        for stmt in &self.statements {
            let expr = match stmt {
                Stmt::Let { expr, .. } | Stmt::Positions { expr } => expr,
            };
            collect_calls(expr, &mut names);
        }
        names
    }

    /// Whether a `positions = ...` statement exists.
    pub fn has_positions(&self) -> bool {
        self.statements
            .iter()
            .any(|s| matches!(s, Stmt::Positions { .. }))
    }

    pub fn complexity(&self) -> ComplexityStats {
        let calls = self.call_names();
        let distinct: BTreeSet<&str> = calls.iter().copied().collect();
        let variables = self
            .statements
            .iter()
            .filter(|s| matches!(s, Stmt::Let { .. }))
            .count();
        let max_call_depth = self
            .statements
            .iter()
            .map(|s| {
                let expr = match s {
                    Stmt::Let { expr, .. } | Stmt::Positions { expr } => expr,
                };
                call_depth(expr)
            })
            .max()
            .unwrap_or(0);
        ComplexityStats {
            statements: self.statements.len(),
            max_call_depth,
            distinct_factors: distinct.len(),
            variables,
        }
    }
}

fn collect_idents<'a>(expr: &'a Expr, f: &mut impl FnMut(&'a str)) {
    match expr {
        Expr::Ident(id) => f(id),
        Expr::Call { inputs, .. } => {
            for input in inputs {
                collect_idents(input, f);
            }
        }
        Expr::Number(_) => {}
    }
}

fn collect_calls<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    if let Expr::Call { name, inputs, .. } = expr {
        out.push(name.as_str());
        for input in inputs {
            collect_calls(input, out);
        }
    }
}

fn call_depth(expr: &Expr) -> usize {
    match expr {
        Expr::Call { inputs, .. } => {
            1 + inputs.iter().map(call_depth).max().unwrap_or(0)
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "strategy t {\n\
        let mom = momentum(close_adj, lookback = 20);\n\
        let sig = mask(mom, liquidity_filter(turnover, min_turnover = 50000000));\n\
        positions = weight_equal(select_top(sig, count = 15));\n\
    }\n";

    #[test]
    fn test_referenced_fields_excludes_bindings() {
        let script = parse(SOURCE).unwrap();
        let fields = script.referenced_fields();
        assert!(fields.contains("close_adj"));
        assert!(fields.contains("turnover"));
        assert!(!fields.contains("mom"));
        assert!(!fields.contains("sig"));
    }

    #[test]
    fn test_call_names_in_order() {
        let script = parse(SOURCE).unwrap();
        assert_eq!(
            script.call_names(),
            vec![
                "momentum",
                "mask",
                "liquidity_filter",
                "weight_equal",
                "select_top"
            ]
        );
    }

    #[test]
    fn test_complexity() {
        let script = parse(SOURCE).unwrap();
        let stats = script.complexity();
        assert_eq!(stats.statements, 3);
        assert_eq!(stats.variables, 2);
        assert_eq!(stats.distinct_factors, 5);
        assert_eq!(stats.max_call_depth, 2);
    }
}
