//! Strategy-script evaluation against the factor registry and the data
//! gateway.

use std::collections::HashMap;

use thiserror::Error;

use crate::domain::error::DataError;
use crate::domain::models::frame::Frame;
use crate::domain::ports::data_accessor::DataAccessor;
use crate::services::factor_registry::{FactorEvalError, FactorRegistry};

use super::{Expr, Script, Stmt};

/// Evaluation failures; the worker maps these to runtime-error results.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unknown factor '{0}'")]
    UnknownFactor(String),

    #[error("Factor '{factor}' does not declare parameter '{param}'")]
    UnknownParam { factor: String, param: String },

    #[error("Unknown identifier '{0}'")]
    UnknownIdentifier(String),

    #[error("A bare number cannot be a frame input")]
    NumberAsInput,

    #[error("Script never assigns 'positions'")]
    NoPositions,

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Factor(#[from] FactorEvalError),
}

/// Evaluate a parsed script to its terminal position matrix.
pub fn evaluate_script(
    script: &Script,
    registry: &FactorRegistry,
    data: &dyn DataAccessor,
) -> Result<Frame, EvalError> {
    let mut env: HashMap<&str, Frame> = HashMap::new();
    let mut positions = None;
    for stmt in &script.statements {
        match stmt {
            Stmt::Let { name, expr } => {
                let frame = eval_expr(expr, &env, registry, data)?;
                env.insert(name.as_str(), frame);
            }
            Stmt::Positions { expr } => {
                positions = Some(eval_expr(expr, &env, registry, data)?);
            }
        }
    }
    positions.ok_or(EvalError::NoPositions)
}

fn eval_expr(
    expr: &Expr,
    env: &HashMap<&str, Frame>,
    registry: &FactorRegistry,
    data: &dyn DataAccessor,
) -> Result<Frame, EvalError> {
    match expr {
        Expr::Number(_) => Err(EvalError::NumberAsInput),
        Expr::Ident(name) => {
            if let Some(frame) = env.get(name.as_str()) {
                Ok(frame.clone())
            } else {
                Ok(data.get(name)?)
            }
        }
        Expr::Call {
            name,
            inputs,
            params,
        } => {
            let spec = registry
                .get(name)
                .ok_or_else(|| EvalError::UnknownFactor(name.clone()))?;
            let mut values = std::collections::BTreeMap::new();
            for (pname, pvalue) in params {
                if spec.param(pname).is_none() {
                    return Err(EvalError::UnknownParam {
                        factor: name.clone(),
                        param: pname.clone(),
                    });
                }
                values.insert(pname.clone(), *pvalue);
            }
            let frames = inputs
                .iter()
                .map(|input| eval_expr(input, env, registry, data))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(spec.apply(&frames, &values)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::script::parse;
    use crate::testutil::StaticAccessor;

    #[test]
    fn test_evaluate_end_to_end() {
        let data = StaticAccessor::trending(40, 4);
        let registry = FactorRegistry::standard();
        let script = parse(
            "strategy t {\n\
             let mom = momentum(close_adj, lookback = 10);\n\
             let top = select_top(mom, count = 2);\n\
             positions = weight_equal(top);\n\
             }",
        )
        .unwrap();
        let positions = evaluate_script(&script, &registry, &data).unwrap();
        assert_eq!(positions.n_symbols(), 4);
        // Past the warmup, each row's weights sum to 1.
        let last = positions.n_dates() - 1;
        let sum: f64 = (0..4).map(|c| positions.get(last, c)).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_factor() {
        let data = StaticAccessor::trending(10, 2);
        let registry = FactorRegistry::standard();
        let script = parse("strategy t { positions = exec_shell(close_adj); }").unwrap();
        assert_eq!(
            evaluate_script(&script, &registry, &data),
            Err(EvalError::UnknownFactor("exec_shell".into()))
        );
    }

    #[test]
    fn test_unknown_param() {
        let data = StaticAccessor::trending(10, 2);
        let registry = FactorRegistry::standard();
        let script =
            parse("strategy t { positions = momentum(close_adj, lookbck = 20); }").unwrap();
        assert!(matches!(
            evaluate_script(&script, &registry, &data),
            Err(EvalError::UnknownParam { .. })
        ));
    }

    #[test]
    fn test_missing_positions() {
        let data = StaticAccessor::trending(10, 2);
        let registry = FactorRegistry::standard();
        let script = parse("strategy t { let m = momentum(close_adj); }").unwrap();
        assert_eq!(
            evaluate_script(&script, &registry, &data),
            Err(EvalError::NoPositions)
        );
    }
}
