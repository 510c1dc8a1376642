//! Thin outer orchestrator: iteration counter, resumption, two-stage
//! cooperative shutdown, and the final run summary. No feedback, no
//! champion logic, no IO details; those live a layer down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::domain::error::HistoryError;
use crate::domain::models::record::ClassificationLevel;

use super::iteration_executor::IterationExecutor;

/// Cooperative cancellation shared with the signal handler.
///
/// First request: graceful. Finish the current iteration, write its
/// record, exit. Second request: force. Abandon the in-flight
/// iteration (its sandbox worker is killed on drop) and exit now.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    graceful: Arc<AtomicBool>,
    force: Arc<AtomicBool>,
    force_notify: Arc<Notify>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one cancel signal; returns true when this was the
    /// second (force) stage.
    pub fn request(&self) -> bool {
        if self.graceful.swap(true, Ordering::SeqCst) {
            self.force.store(true, Ordering::SeqCst);
            self.force_notify.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn graceful_requested(&self) -> bool {
        self.graceful.load(Ordering::SeqCst)
    }

    pub fn force_requested(&self) -> bool {
        self.force.load(Ordering::SeqCst)
    }

    async fn forced(&self) {
        loop {
            // Register before checking the flag so a notify between the
            // check and the await cannot be missed.
            let mut notified = std::pin::pin!(self.force_notify.notified());
            notified.as_mut().enable();
            if self.force_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Final summary of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub iterations_run: u64,
    /// Counts by classification level, index = level.
    pub level_counts: [u64; 4],
    pub best_sharpe: Option<f64>,
    pub champion_sharpe: Option<f64>,
    pub wall_time: Duration,
    pub cancelled: bool,
}

/// The outer loop.
pub struct LearningLoop {
    executor: IterationExecutor,
    max_iterations: u64,
    iteration_timeout: Duration,
    shutdown: ShutdownHandle,
}

impl LearningLoop {
    pub fn new(
        executor: IterationExecutor,
        max_iterations: u64,
        iteration_timeout_secs: u64,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            executor,
            max_iterations,
            iteration_timeout: Duration::from_secs(iteration_timeout_secs.max(1)),
            shutdown,
        }
    }

    pub fn executor(&self) -> &IterationExecutor {
        &self.executor
    }

    /// Run until the iteration budget, a fatal infrastructure error,
    /// or cancellation.
    pub async fn run(&mut self) -> Result<RunSummary, HistoryError> {
        let started = Instant::now();
        // Resume: pick up one past the highest iteration on record.
        let mut counter = self.executor.history().next_iteration_num();
        let first = counter;
        let mut level_counts = [0u64; 4];
        let mut best_sharpe: Option<f64> = None;

        tracing::info!(
            start = counter,
            max = self.max_iterations,
            "Learning loop starting"
        );

        while counter < self.max_iterations && !self.shutdown.graceful_requested() {
            let outcome = tokio::select! {
                // Abandoning the future kills any in-flight worker via
                // kill_on_drop; the iteration leaves no record.
                () = self.shutdown.forced() => {
                    tracing::warn!(iteration = counter, "Force shutdown; abandoning iteration");
                    break;
                }
                outcome = tokio::time::timeout(
                    self.iteration_timeout,
                    self.executor.run_iteration(counter),
                ) => outcome,
            };

            match outcome {
                Err(_) => {
                    tracing::error!(
                        iteration = counter,
                        timeout_secs = self.iteration_timeout.as_secs(),
                        "Iteration exceeded its overall budget; slot consumed without a record"
                    );
                }
                Ok(Err(e)) => {
                    // History failures are the one fatal class.
                    tracing::error!(iteration = counter, error = %e, "Fatal infrastructure error");
                    return Err(e);
                }
                Ok(Ok(record)) => {
                    level_counts[level_index(record.classification_level)] += 1;
                    if let Some(metrics) = &record.metrics {
                        best_sharpe = Some(
                            best_sharpe.map_or(metrics.sharpe_ratio, |b: f64| {
                                b.max(metrics.sharpe_ratio)
                            }),
                        );
                    }
                }
            }
            counter += 1;
        }

        let cancelled = self.shutdown.graceful_requested();
        if cancelled {
            tracing::info!("Learning loop cancelled cooperatively");
        }
        Ok(RunSummary {
            iterations_run: counter - first,
            level_counts,
            best_sharpe,
            champion_sharpe: self
                .executor
                .champion()
                .current()
                .map(|c| c.metrics.sharpe_ratio),
            wall_time: started.elapsed(),
            cancelled,
        })
    }
}

const fn level_index(level: ClassificationLevel) -> usize {
    match level {
        ClassificationLevel::Level0Failed => 0,
        ClassificationLevel::Level1Executed => 1,
        ClassificationLevel::Level2Valid => 2,
        ClassificationLevel::Level3Acceptable => 3,
    }
}
