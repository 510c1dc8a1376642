//! Forbidden data keys are hard-rejected before any worker starts.

use alphaloop::domain::models::config::RebalanceFrequency;
use alphaloop::domain::models::execution::ExecutionStatus;
use alphaloop::domain::models::record::ClassificationLevel;
use alphaloop::services::classifier::SuccessClassifier;
use alphaloop::services::factor_registry::FactorRegistry;
use alphaloop::services::validator::StrategyValidator;
use alphaloop::testutil::{code_artifact, manifest};

#[test]
fn forbidden_raw_price_key_never_reaches_the_sandbox() {
    let validator = StrategyValidator::new(manifest(), RebalanceFrequency::Weekly);
    let artifact = code_artifact(
        "strategy t {\n\
         let mom = momentum(close_raw, lookback = 20);\n\
         positions = weight_equal(select_top(mom, count = 10));\n\
         }",
    );

    let report = validator.validate(&artifact, &FactorRegistry::standard());
    assert!(!report.is_valid);
    assert!(report
        .violations
        .iter()
        .any(|v| v.contains("forbidden data key 'close_raw'")));

    // The rejection is recorded as a validation failure and classified
    // level 0; metrics never exist for it.
    let status = ExecutionStatus::ValidationFail {
        violations: report.violations,
    };
    let classifier = SuccessClassifier::new(&Default::default());
    assert_eq!(
        classifier.classify(&status, None),
        ClassificationLevel::Level0Failed
    );
}

#[test]
fn warnings_alone_do_not_reject() {
    let validator = StrategyValidator::new(manifest(), RebalanceFrequency::Daily);
    let artifact = code_artifact(
        "strategy t {\n\
         let mom = momentum(close_adj, lookback = 5);\n\
         positions = weight_equal(select_top(mom, count = 40));\n\
         }",
    );
    let report = validator.validate(&artifact, &FactorRegistry::standard());
    assert!(report.is_valid);
    assert!(!report.warnings.is_empty());
}
