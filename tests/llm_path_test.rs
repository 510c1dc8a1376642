//! LLM generation path: success, bounded schema retries, and the
//! fallthrough to the factor-graph path.

mod common;

use std::sync::Arc;

use alphaloop::domain::models::artifact::GenerationMethod;
use alphaloop::infrastructure::monitor::InMemorySink;
use alphaloop::testutil::ScriptedLlm;
use alphaloop::{LearningLoop, ShutdownHandle};

#[tokio::test]
async fn llm_success_path_calls_once_per_iteration() {
    let dir = tempfile::tempdir().unwrap();
    common::write_market_fixture(dir.path());

    let mut config = common::test_config(dir.path());
    config.engine.max_iterations = 3;
    config.engine.innovation_rate = 1.0;

    // Templates rotate by iteration; one matching reply per call.
    let llm = Arc::new(ScriptedLlm::new(vec![
        common::VALID_MOMENTUM_REPLY,
        common::VALID_MEAN_REVERSION_REPLY,
        common::VALID_BREAKOUT_REPLY,
    ]));
    let monitor = Arc::new(InMemorySink::new());
    let executor = common::build_executor(&config, Some(llm.clone()), monitor);
    let mut learning_loop = LearningLoop::new(
        executor,
        config.engine.max_iterations,
        config.engine.iteration_timeout_secs,
        ShutdownHandle::new(),
    );
    learning_loop.run().await.unwrap();

    // Schema-valid replies mean exactly one call per iteration.
    assert_eq!(llm.calls(), 3);

    let records: Vec<_> = learning_loop
        .executor()
        .history()
        .iter_all()
        .cloned()
        .collect();
    assert_eq!(records.len(), 3);
    for record in &records {
        assert_eq!(record.generation_method, GenerationMethod::Llm);
        record.check_invariants().unwrap();
    }
}

#[tokio::test]
async fn llm_schema_exhaustion_falls_through_to_factor_graph() {
    let dir = tempfile::tempdir().unwrap();
    common::write_market_fixture(dir.path());

    let mut config = common::test_config(dir.path());
    config.engine.max_iterations = 1;
    config.engine.innovation_rate = 1.0;

    // Malformed on every call: the generator burns its bounded retry
    // budget, then the factor-graph path takes over.
    let llm = Arc::new(ScriptedLlm::new(vec!["not json"]));
    let monitor = Arc::new(InMemorySink::new());
    let executor = common::build_executor(&config, Some(llm.clone()), monitor);
    let mut learning_loop = LearningLoop::new(
        executor,
        config.engine.max_iterations,
        config.engine.iteration_timeout_secs,
        ShutdownHandle::new(),
    );
    learning_loop.run().await.unwrap();

    // Exactly retry_max + 1 LLM calls for the single iteration.
    assert_eq!(llm.calls(), config.llm.retry_max + 1);

    let records: Vec<_> = learning_loop
        .executor()
        .history()
        .iter_all()
        .cloned()
        .collect();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].generation_method,
        GenerationMethod::FactorGraph
    );
    // The fallthrough artifact still executes; the iteration is not a
    // generation failure.
    assert!(records[0]
        .classification_level
        > alphaloop::domain::models::record::ClassificationLevel::Level0Failed);
}

#[tokio::test]
async fn llm_transport_failure_degrades_to_factor_graph() {
    let dir = tempfile::tempdir().unwrap();
    common::write_market_fixture(dir.path());

    let mut config = common::test_config(dir.path());
    config.engine.max_iterations = 2;
    config.engine.innovation_rate = 1.0;

    let llm = Arc::new(ScriptedLlm::failing(
        alphaloop::domain::error::LlmError::AllProvidersExhausted,
    ));
    let monitor = Arc::new(InMemorySink::new());
    let executor = common::build_executor(&config, Some(llm), monitor);
    let mut learning_loop = LearningLoop::new(
        executor,
        config.engine.max_iterations,
        config.engine.iteration_timeout_secs,
        ShutdownHandle::new(),
    );
    learning_loop.run().await.unwrap();

    let records: Vec<_> = learning_loop
        .executor()
        .history()
        .iter_all()
        .cloned()
        .collect();
    assert_eq!(records.len(), 2);
    for record in records {
        assert_eq!(record.generation_method, GenerationMethod::FactorGraph);
    }
}
