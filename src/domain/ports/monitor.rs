//! Fire-and-forget monitoring port.
//!
//! The core emits events and never depends on the consumer; emissions
//! are best-effort, may be reordered, and stay off the sandbox hot
//! path.

use std::sync::Arc;

use crate::domain::models::record::ClassificationLevel;

/// Pipeline stages whose wall time is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Generation,
    Validation,
    Sandbox,
    Scoring,
    Persistence,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Validation => "validation",
            Self::Sandbox => "sandbox",
            Self::Scoring => "scoring",
            Self::Persistence => "persistence",
        }
    }
}

/// One monitoring emission.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Counter: one iteration finished at the given level.
    IterationCompleted(ClassificationLevel),
    /// Histogram sample: stage wall time in seconds.
    StageTiming { stage: Stage, seconds: f64 },
    /// Gauge: Sharpe of the current champion.
    ChampionSharpe(f64),
    /// Gauge: most recent diversity score.
    Diversity(f64),
    /// Counter: orphaned workers reclaimed by the reaper.
    OrphansReaped(u64),
}

/// Side observer receiving metric events.
pub trait MonitorSink: Send + Sync {
    fn emit(&self, event: MonitorEvent);
}

/// Shared sink handle.
pub type SharedMonitor = Arc<dyn MonitorSink>;

/// Sink that drops everything; the default when monitoring is not
/// wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MonitorSink for NullSink {
    fn emit(&self, _event: MonitorEvent) {}
}
