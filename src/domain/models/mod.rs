//! Domain models: artifacts, records, metrics, frames, configuration.

pub mod artifact;
pub mod champion;
pub mod config;
pub mod execution;
pub mod frame;
pub mod metrics;
pub mod record;

pub use artifact::{
    CodeStrategy, FactorCategory, FactorDag, FactorNode, GenerationMethod, GraphStrategy,
    InputRef, StrategyArtifact,
};
pub use champion::ChampionRecord;
pub use config::Config;
pub use execution::{ExecutionResult, ExecutionStage, ExecutionStatus, ResourceKind};
pub use frame::Frame;
pub use metrics::{BacktestReport, MetricsRecord, SummaryStats};
pub use record::{ClassificationLevel, IterationRecord, StrategyIdentity};
