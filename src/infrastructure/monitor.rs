//! Monitoring sinks behind the fire-and-forget port.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::models::record::ClassificationLevel;
use crate::domain::ports::monitor::{MonitorEvent, MonitorSink};

/// Counter/gauge snapshot held in memory; the process-local consumer
/// for tests and the final run summary.
#[derive(Debug, Default)]
pub struct InMemorySink {
    state: Mutex<SinkState>,
}

#[derive(Debug, Default)]
struct SinkState {
    level_counts: HashMap<ClassificationLevel, u64>,
    stage_samples: HashMap<&'static str, Vec<f64>>,
    champion_sharpe: Option<f64>,
    diversity: Option<f64>,
    orphans_reaped: u64,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level_count(&self, level: ClassificationLevel) -> u64 {
        self.state
            .lock()
            .expect("sink lock")
            .level_counts
            .get(&level)
            .copied()
            .unwrap_or(0)
    }

    pub fn champion_sharpe(&self) -> Option<f64> {
        self.state.lock().expect("sink lock").champion_sharpe
    }

    pub fn diversity(&self) -> Option<f64> {
        self.state.lock().expect("sink lock").diversity
    }

    pub fn orphans_reaped(&self) -> u64 {
        self.state.lock().expect("sink lock").orphans_reaped
    }

    pub fn stage_sample_count(&self, stage: &str) -> usize {
        self.state
            .lock()
            .expect("sink lock")
            .stage_samples
            .get(stage)
            .map_or(0, Vec::len)
    }
}

impl MonitorSink for InMemorySink {
    fn emit(&self, event: MonitorEvent) {
        let mut state = self.state.lock().expect("sink lock");
        match event {
            MonitorEvent::IterationCompleted(level) => {
                *state.level_counts.entry(level).or_default() += 1;
            }
            MonitorEvent::StageTiming { stage, seconds } => {
                state.stage_samples.entry(stage.as_str()).or_default().push(seconds);
            }
            MonitorEvent::ChampionSharpe(sharpe) => state.champion_sharpe = Some(sharpe),
            MonitorEvent::Diversity(diversity) => state.diversity = Some(diversity),
            MonitorEvent::OrphansReaped(count) => state.orphans_reaped += count,
        }
    }
}

/// Sink that forwards events to the log stream at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MonitorSink for TracingSink {
    fn emit(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::IterationCompleted(level) => {
                tracing::debug!(level = %level, "monitor: iteration completed");
            }
            MonitorEvent::StageTiming { stage, seconds } => {
                tracing::debug!(stage = stage.as_str(), seconds, "monitor: stage timing");
            }
            MonitorEvent::ChampionSharpe(sharpe) => {
                tracing::debug!(sharpe, "monitor: champion sharpe");
            }
            MonitorEvent::Diversity(diversity) => {
                tracing::debug!(diversity, "monitor: diversity");
            }
            MonitorEvent::OrphansReaped(count) => {
                tracing::debug!(count, "monitor: orphans reaped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::monitor::Stage;

    #[test]
    fn test_in_memory_sink_accumulates() {
        let sink = InMemorySink::new();
        sink.emit(MonitorEvent::IterationCompleted(
            ClassificationLevel::Level2Valid,
        ));
        sink.emit(MonitorEvent::IterationCompleted(
            ClassificationLevel::Level2Valid,
        ));
        sink.emit(MonitorEvent::StageTiming {
            stage: Stage::Sandbox,
            seconds: 1.5,
        });
        sink.emit(MonitorEvent::ChampionSharpe(1.2));
        sink.emit(MonitorEvent::OrphansReaped(0));

        assert_eq!(sink.level_count(ClassificationLevel::Level2Valid), 2);
        assert_eq!(sink.level_count(ClassificationLevel::Level0Failed), 0);
        assert_eq!(sink.stage_sample_count("sandbox"), 1);
        assert_eq!(sink.champion_sharpe(), Some(1.2));
        assert_eq!(sink.orphans_reaped(), 0);
    }
}
