//! LLM-driven template-plus-parameters generator.
//!
//! JSON-first discipline: the model is asked for a JSON parameter
//! object matching a declared schema, never for executable code. A
//! deterministic materializer turns validated parameters into strategy
//! script text, so the syntactic layer of validation passes by
//! construction. Failure modes reduce to schema violations, which are
//! retried a bounded number of times with the error fed back.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::error::GenerationError;
use crate::domain::models::artifact::{CodeStrategy, GenerationMethod, StrategyArtifact};
use crate::domain::models::config::LlmConfig;
use crate::domain::ports::data_accessor::{FieldCategory, FieldManifest};
use crate::domain::ports::llm_client::{LlmClient, LlmRequest};

use super::{GenerationContext, StrategyGenerator};

/// Declared type and range of one template parameter.
#[derive(Debug, Clone)]
pub enum ParamKind {
    Int { min: i64, max: i64, default: i64 },
    Float { min: f64, max: f64, default: f64 },
    Choice {
        options: &'static [&'static str],
        default: &'static str,
    },
}

/// One named template parameter.
#[derive(Debug, Clone)]
pub struct ParamField {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ParamKind,
}

type Materialize = fn(&BTreeMap<String, serde_json::Value>) -> String;

/// A registered strategy template.
pub struct Template {
    pub name: &'static str,
    pub description: &'static str,
    pub params: Vec<ParamField>,
    materialize: Materialize,
}

impl Template {
    /// Example parameter object built from defaults, used few-shot.
    fn example(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for field in &self.params {
            let value = match &field.kind {
                ParamKind::Int { default, .. } => serde_json::json!(default),
                ParamKind::Float { default, .. } => serde_json::json!(default),
                ParamKind::Choice { default, .. } => serde_json::json!(default),
            };
            map.insert(field.name.to_string(), value);
        }
        serde_json::Value::Object(map)
    }

    /// Schema description embedded in the prompt.
    fn schema_json(&self) -> serde_json::Value {
        let params: Vec<serde_json::Value> = self
            .params
            .iter()
            .map(|f| match &f.kind {
                ParamKind::Int { min, max, default } => serde_json::json!({
                    "name": f.name,
                    "type": "integer",
                    "min": min,
                    "max": max,
                    "default": default,
                    "description": f.description,
                }),
                ParamKind::Float { min, max, default } => serde_json::json!({
                    "name": f.name,
                    "type": "number",
                    "min": min,
                    "max": max,
                    "default": default,
                    "description": f.description,
                }),
                ParamKind::Choice { options, default } => serde_json::json!({
                    "name": f.name,
                    "type": "choice",
                    "options": options,
                    "default": default,
                    "description": f.description,
                }),
            })
            .collect();
        serde_json::json!({ "template": self.name, "parameters": params })
    }

    /// Validate a parsed reply object against the schema.
    fn validate(
        &self,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, serde_json::Value>, String> {
        let mut validated = BTreeMap::new();
        for key in object.keys() {
            if !self.params.iter().any(|f| f.name == key) {
                return Err(format!("unknown parameter '{key}'"));
            }
        }
        for field in &self.params {
            let Some(value) = object.get(field.name) else {
                return Err(format!("missing parameter '{}'", field.name));
            };
            match &field.kind {
                ParamKind::Int { min, max, .. } => {
                    let v = value
                        .as_i64()
                        .ok_or_else(|| format!("parameter '{}' must be an integer", field.name))?;
                    if v < *min || v > *max {
                        return Err(format!(
                            "parameter '{}' = {v} outside [{min}, {max}]",
                            field.name
                        ));
                    }
                }
                ParamKind::Float { min, max, .. } => {
                    let v = value
                        .as_f64()
                        .ok_or_else(|| format!("parameter '{}' must be a number", field.name))?;
                    if v < *min || v > *max {
                        return Err(format!(
                            "parameter '{}' = {v} outside [{min}, {max}]",
                            field.name
                        ));
                    }
                }
                ParamKind::Choice { options, .. } => {
                    let v = value
                        .as_str()
                        .ok_or_else(|| format!("parameter '{}' must be a string", field.name))?;
                    if !options.contains(&v) {
                        return Err(format!(
                            "parameter '{}' = '{v}' not one of {options:?}",
                            field.name
                        ));
                    }
                }
            }
            validated.insert(field.name.to_string(), value.clone());
        }
        Ok(validated)
    }
}

fn int_param(params: &BTreeMap<String, serde_json::Value>, name: &str) -> i64 {
    params.get(name).and_then(serde_json::Value::as_i64).unwrap_or(0)
}

fn float_param(params: &BTreeMap<String, serde_json::Value>, name: &str) -> f64 {
    params.get(name).and_then(serde_json::Value::as_f64).unwrap_or(0.0)
}

fn str_param<'a>(params: &'a BTreeMap<String, serde_json::Value>, name: &str) -> &'a str {
    params.get(name).and_then(serde_json::Value::as_str).unwrap_or("")
}

fn materialize_momentum(params: &BTreeMap<String, serde_json::Value>) -> String {
    let weighting = if str_param(params, "weighting") == "score" {
        "weight_by_score(mask(mom, held))"
    } else {
        "weight_equal(held)"
    };
    format!(
        "strategy tw_momentum {{\n\
         \x20   let mom = momentum(close_adj, lookback = {lookback});\n\
         \x20   let liq = liquidity_filter(turnover, min_turnover = {min_turnover});\n\
         \x20   let sig = mask(mom, liq);\n\
         \x20   let top = select_top(sig, count = {portfolio_size});\n\
         \x20   let stop = trailing_stop(close_adj, fraction = {stop_fraction});\n\
         \x20   let held = mask(top, stop);\n\
         \x20   positions = {weighting};\n\
         }}\n",
        lookback = int_param(params, "lookback"),
        min_turnover = float_param(params, "min_turnover"),
        portfolio_size = int_param(params, "portfolio_size"),
        stop_fraction = float_param(params, "stop_fraction"),
    )
}

fn materialize_mean_reversion(params: &BTreeMap<String, serde_json::Value>) -> String {
    format!(
        "strategy tw_mean_reversion {{\n\
         \x20   let rev = mean_reversion(close_adj, window = {window});\n\
         \x20   let liq = liquidity_filter(turnover, min_turnover = {min_turnover});\n\
         \x20   let sig = mask(rev, liq);\n\
         \x20   let top = select_top(sig, count = {portfolio_size});\n\
         \x20   positions = weight_equal(top);\n\
         }}\n",
        window = int_param(params, "window"),
        min_turnover = float_param(params, "min_turnover"),
        portfolio_size = int_param(params, "portfolio_size"),
    )
}

fn materialize_breakout(params: &BTreeMap<String, serde_json::Value>) -> String {
    format!(
        "strategy tw_breakout {{\n\
         \x20   let brk = breakout(close_adj, window = {window});\n\
         \x20   let liq = liquidity_filter(turnover, min_turnover = {min_turnover});\n\
         \x20   let sig = mask(brk, liq);\n\
         \x20   let top = select_top(sig, count = {portfolio_size});\n\
         \x20   let stop = trailing_stop(close_adj, fraction = {stop_fraction});\n\
         \x20   positions = weight_equal(mask(top, stop));\n\
         }}\n",
        window = int_param(params, "window"),
        min_turnover = float_param(params, "min_turnover"),
        portfolio_size = int_param(params, "portfolio_size"),
        stop_fraction = float_param(params, "stop_fraction"),
    )
}

/// The registered template catalog.
pub fn standard_templates() -> Vec<Template> {
    vec![
        Template {
            name: "momentum",
            description: "Cross-sectional momentum with liquidity screen and trailing stop",
            params: vec![
                ParamField {
                    name: "lookback",
                    description: "Momentum lookback in trading days",
                    kind: ParamKind::Int {
                        min: 5,
                        max: 120,
                        default: 20,
                    },
                },
                ParamField {
                    name: "portfolio_size",
                    description: "Number of names held",
                    kind: ParamKind::Int {
                        min: 5,
                        max: 30,
                        default: 15,
                    },
                },
                ParamField {
                    name: "min_turnover",
                    description: "Minimum daily turnover in TWD",
                    kind: ParamKind::Float {
                        min: 1e6,
                        max: 1e9,
                        default: 5e7,
                    },
                },
                ParamField {
                    name: "stop_fraction",
                    description: "Trailing stop distance as a fraction of the rolling peak",
                    kind: ParamKind::Float {
                        min: 0.05,
                        max: 0.20,
                        default: 0.10,
                    },
                },
                ParamField {
                    name: "weighting",
                    description: "Position weighting scheme",
                    kind: ParamKind::Choice {
                        options: &["equal", "score"],
                        default: "equal",
                    },
                },
            ],
            materialize: materialize_momentum,
        },
        Template {
            name: "mean_reversion",
            description: "Short-horizon reversal with liquidity screen",
            params: vec![
                ParamField {
                    name: "window",
                    description: "Z-score window in trading days",
                    kind: ParamKind::Int {
                        min: 10,
                        max: 60,
                        default: 20,
                    },
                },
                ParamField {
                    name: "portfolio_size",
                    description: "Number of names held",
                    kind: ParamKind::Int {
                        min: 5,
                        max: 30,
                        default: 15,
                    },
                },
                ParamField {
                    name: "min_turnover",
                    description: "Minimum daily turnover in TWD",
                    kind: ParamKind::Float {
                        min: 1e6,
                        max: 1e9,
                        default: 5e7,
                    },
                },
            ],
            materialize: materialize_mean_reversion,
        },
        Template {
            name: "breakout",
            description: "Channel breakout with trailing stop",
            params: vec![
                ParamField {
                    name: "window",
                    description: "Breakout channel window in trading days",
                    kind: ParamKind::Int {
                        min: 20,
                        max: 120,
                        default: 55,
                    },
                },
                ParamField {
                    name: "portfolio_size",
                    description: "Number of names held",
                    kind: ParamKind::Int {
                        min: 5,
                        max: 30,
                        default: 15,
                    },
                },
                ParamField {
                    name: "min_turnover",
                    description: "Minimum daily turnover in TWD",
                    kind: ParamKind::Float {
                        min: 1e6,
                        max: 1e9,
                        default: 5e7,
                    },
                },
                ParamField {
                    name: "stop_fraction",
                    description: "Trailing stop distance as a fraction of the rolling peak",
                    kind: ParamKind::Float {
                        min: 0.05,
                        max: 0.20,
                        default: 0.10,
                    },
                },
            ],
            materialize: materialize_breakout,
        },
    ]
}

/// The LLM generation path.
pub struct TemplateParameterGenerator {
    templates: Vec<Template>,
    llm: Arc<dyn LlmClient>,
    config: LlmConfig,
    manifest: FieldManifest,
}

impl TemplateParameterGenerator {
    pub fn new(llm: Arc<dyn LlmClient>, config: LlmConfig, manifest: FieldManifest) -> Self {
        Self {
            templates: standard_templates(),
            llm,
            config,
            manifest,
        }
    }

    /// Deterministic template rotation keyed by the iteration number.
    fn pick_template(&self, iteration_num: u64) -> &Template {
        let idx = (iteration_num as usize) % self.templates.len();
        &self.templates[idx]
    }

    /// Build the generation prompt.
    ///
    /// Data keys are listed adjusted-first with a "preferred" marker
    /// and forbidden keys last with a "forbidden" marker; that ordering
    /// measurably drives validation success and must not be reversed.
    fn build_prompt(
        &self,
        template: &Template,
        ctx: &GenerationContext<'_>,
        prior_error: Option<&str>,
    ) -> String {
        let mut prompt = String::new();
        let _ = writeln!(
            prompt,
            "You are configuring a quantitative strategy template for the Taiwan \
             equities market.\n\
             Template: {} ({})\n\
             Reply with a single JSON object assigning a value to every parameter. \
             JSON only, no prose, no code.\n",
            template.name, template.description
        );
        let _ = writeln!(prompt, "Parameter schema:\n{}\n", template.schema_json());
        let _ = writeln!(prompt, "Example reply:\n{}\n", template.example());

        let _ = writeln!(prompt, "Permitted data keys:");
        for key in self.manifest.keys_in(FieldCategory::AdjustedPrice) {
            let _ = writeln!(prompt, "  {key} (adjusted price, preferred)");
        }
        for category in [
            FieldCategory::Fundamental,
            FieldCategory::TechnicalIndicator,
            FieldCategory::Liquidity,
        ] {
            for key in self.manifest.keys_in(category) {
                let _ = writeln!(prompt, "  {key}");
            }
        }
        for key in self.manifest.keys_in(FieldCategory::RawPrice) {
            let _ = writeln!(prompt, "  {key} (raw price, forbidden for backtesting)");
        }

        if !ctx.feedback.is_empty() {
            let _ = writeln!(prompt, "\nPerformance feedback:\n{}", ctx.feedback);
        }
        if !ctx.avoided_patterns.is_empty() {
            let _ = writeln!(
                prompt,
                "\nAvoid these patterns: {}",
                ctx.avoided_patterns.join(", ")
            );
        }
        if let Some(error) = prior_error {
            let _ = writeln!(
                prompt,
                "\nYour previous reply was rejected: {error}\n\
                 Correct the JSON object and reply again."
            );
        }
        prompt
    }

    /// Pull a JSON object out of a reply, tolerating code fences.
    fn extract_json(text: &str) -> Result<serde_json::Map<String, serde_json::Value>, String> {
        let start = text.find('{').ok_or("reply contains no JSON object")?;
        let end = text.rfind('}').ok_or("reply contains no closing brace")?;
        if end < start {
            return Err("malformed JSON object".to_string());
        }
        let value: serde_json::Value = serde_json::from_str(&text[start..=end])
            .map_err(|e| format!("JSON parse error: {e}"))?;
        match value {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err("reply is not a JSON object".to_string()),
        }
    }
}

#[async_trait]
impl StrategyGenerator for TemplateParameterGenerator {
    fn method(&self) -> GenerationMethod {
        GenerationMethod::Llm
    }

    async fn generate(
        &mut self,
        ctx: &GenerationContext<'_>,
    ) -> Result<StrategyArtifact, GenerationError> {
        let template = self.pick_template(ctx.iteration_num);
        let max_attempts = self.config.retry_max + 1;
        let mut prior_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            let prompt = self.build_prompt(template, ctx, prior_error.as_deref());
            let mut request = LlmRequest::json(prompt);
            request.max_tokens = self.config.max_tokens;
            request.temperature = self.config.temperature;

            let response = self.llm.request(request).await?;

            match Self::extract_json(&response.text)
                .and_then(|object| template.validate(&object))
            {
                Ok(parameters) => {
                    let code_text = (template.materialize)(&parameters);
                    tracing::debug!(
                        template = template.name,
                        attempt,
                        "Template parameters validated"
                    );
                    return Ok(StrategyArtifact::Llm(CodeStrategy {
                        code_text,
                        parameters,
                        template_name: template.name.to_string(),
                        model_id: response.model,
                    }));
                }
                Err(error) => {
                    tracing::warn!(
                        template = template.name,
                        attempt,
                        max_attempts,
                        error = %error,
                        "LLM reply failed schema validation"
                    );
                    prior_error = Some(error);
                }
            }
        }
        Err(GenerationError::LlmSchema {
            attempts: max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::script::parse;
    use crate::testutil::{manifest, ScriptedLlm};

    fn context() -> GenerationContext<'static> {
        GenerationContext {
            iteration_num: 0,
            feedback: "",
            avoided_patterns: &[],
            champion: None,
            diversity: 1.0,
        }
    }

    fn generator(replies: Vec<&str>) -> TemplateParameterGenerator {
        TemplateParameterGenerator::new(
            Arc::new(ScriptedLlm::new(replies)),
            LlmConfig::default(),
            manifest(),
        )
    }

    const VALID_REPLY: &str = r#"{"lookback": 30, "portfolio_size": 12,
        "min_turnover": 80000000.0, "stop_fraction": 0.08, "weighting": "equal"}"#;

    #[tokio::test]
    async fn test_valid_reply_materializes_parseable_script() {
        let mut g = generator(vec![VALID_REPLY]);
        let artifact = g.generate(&context()).await.unwrap();
        let StrategyArtifact::Llm(code) = &artifact else {
            panic!("expected code artifact");
        };
        assert_eq!(code.template_name, "momentum");
        assert!(code.code_text.contains("lookback = 30"));
        // Materialized text passes the syntactic layer by construction.
        parse(&code.code_text).unwrap();
    }

    #[tokio::test]
    async fn test_fenced_reply_accepted() {
        let fenced = format!("```json\n{VALID_REPLY}\n```");
        let mut g = generator(vec![&fenced]);
        assert!(g.generate(&context()).await.is_ok());
    }

    #[tokio::test]
    async fn test_retry_then_success_counts_calls() {
        let mut g = generator(vec!["not json at all", VALID_REPLY]);
        let artifact = g.generate(&context()).await;
        assert!(artifact.is_ok());
    }

    #[tokio::test]
    async fn test_schema_exhaustion_bounded_calls() {
        // All replies malformed: exactly retry_max + 1 calls, then a
        // typed failure.
        let llm = Arc::new(ScriptedLlm::new(vec!["garbage"; 10]));
        let mut g = TemplateParameterGenerator::new(
            llm.clone(),
            LlmConfig::default(),
            manifest(),
        );
        let err = g.generate(&context()).await.unwrap_err();
        assert!(matches!(err, GenerationError::LlmSchema { attempts: 4 }));
        assert_eq!(llm.calls(), 4);
    }

    #[tokio::test]
    async fn test_out_of_range_parameter_rejected() {
        let bad = r#"{"lookback": 500, "portfolio_size": 12, "min_turnover": 8e7,
            "stop_fraction": 0.08, "weighting": "equal"}"#;
        let mut g = generator(vec![bad, VALID_REPLY]);
        // First reply rejected on range, second accepted.
        assert!(g.generate(&context()).await.is_ok());
    }

    #[test]
    fn test_prompt_orders_preferred_before_forbidden() {
        let g = generator(vec![]);
        let template = &g.templates[0];
        let prompt = g.build_prompt(template, &context(), None);
        let preferred = prompt.find("preferred").expect("preferred marker");
        let forbidden = prompt.find("forbidden").expect("forbidden marker");
        assert!(preferred < forbidden);
    }

    #[test]
    fn test_every_template_materializes_valid_scripts() {
        for template in standard_templates() {
            let object = template.example();
            let serde_json::Value::Object(map) = object else {
                unreachable!()
            };
            let params = template.validate(&map).unwrap();
            let code = (template.materialize)(&params);
            parse(&code).unwrap_or_else(|e| panic!("{}: {e}", template.name));
        }
    }
}
