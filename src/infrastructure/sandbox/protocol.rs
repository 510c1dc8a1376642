//! Wire protocol between the executor and its worker processes, plus
//! the worker-side pipeline itself.
//!
//! The job travels to the worker as one JSON object on stdin. The
//! worker emits JSON lines on stdout: zero or more stage markers, then
//! exactly one final outcome. Keeping the pipeline here (rather than in
//! the worker binary) lets the in-process fallback and the tests run
//! the identical code path.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::models::artifact::StrategyArtifact;
use crate::domain::models::config::RebalanceFrequency;
use crate::domain::models::execution::ExecutionStage;
use crate::domain::models::metrics::BacktestReport;
use crate::domain::ports::data_accessor::DataAccessor;
use crate::infrastructure::simulator::{simulate, CostModel};
use crate::services::evaluator::evaluate_artifact;
use crate::services::factor_registry::FactorRegistry;

/// Everything a worker needs to run one strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerJob {
    pub artifact: StrategyArtifact,
    pub manifest_path: String,
    pub data_dir: String,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub commission: f64,
    pub tax: f64,
    pub rebalance: RebalanceFrequency,
}

/// One line of worker stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerLine {
    /// Progress marker; the executor records the last stage seen so a
    /// timeout can name where it landed.
    Stage { stage: ExecutionStage },
    /// Terminal success.
    Done { report: BacktestReport },
    /// Terminal strategy-level failure (not a worker crash).
    Failed {
        error_kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack_text: Option<String>,
    },
}

/// Run the worker pipeline against an already-open data accessor,
/// reporting lines through `emit`.
pub fn run_pipeline(
    job: &WorkerJob,
    data: &dyn DataAccessor,
    mut emit: impl FnMut(&WorkerLine),
) {
    emit(&WorkerLine::Stage {
        stage: ExecutionStage::Evaluation,
    });
    let registry = FactorRegistry::standard();
    let positions = match evaluate_artifact(&job.artifact, &registry, data) {
        Ok(frame) => frame.row_normalize(),
        Err(e) => {
            emit(&WorkerLine::Failed {
                error_kind: "evaluation".to_string(),
                message: e.to_string(),
                stack_text: None,
            });
            return;
        }
    };

    // The simulator takes no date parameters; the window is applied by
    // row-filtering here.
    let start = job.start_date.unwrap_or(positions.dates()[0]);
    let end = job
        .end_date
        .unwrap_or(positions.dates()[positions.n_dates() - 1]);
    let positions = match positions.filter_dates(start, end) {
        Ok(frame) => frame,
        Err(e) => {
            emit(&WorkerLine::Failed {
                error_kind: "date_range".to_string(),
                message: e.to_string(),
                stack_text: None,
            });
            return;
        }
    };

    emit(&WorkerLine::Stage {
        stage: ExecutionStage::Simulation,
    });
    let prices = match data.get("close_adj") {
        Ok(frame) => frame,
        Err(e) => {
            emit(&WorkerLine::Failed {
                error_kind: "data".to_string(),
                message: e.to_string(),
                stack_text: None,
            });
            return;
        }
    };
    let cost = CostModel {
        commission: job.commission,
        tax: job.tax,
        rebalance: job.rebalance,
    };
    match simulate(&positions, &prices, &cost) {
        Ok(report) => emit(&WorkerLine::Done { report }),
        Err(e) => emit(&WorkerLine::Failed {
            error_kind: "simulation".to_string(),
            message: e.to_string(),
            stack_text: None,
        }),
    }
}

/// Worker-binary entry: one job on stdin, JSON lines on stdout.
/// Returns the process exit code.
pub fn run_worker_stdio() -> i32 {
    use std::io::{Read, Write};

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        eprintln!("worker: failed to read job: {e}");
        return 2;
    }
    let job: WorkerJob = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("worker: malformed job: {e}");
            return 2;
        }
    };

    let stdout = std::io::stdout();
    let mut emit = |line: &WorkerLine| {
        let mut handle = stdout.lock();
        if let Ok(json) = serde_json::to_string(line) {
            let _ = writeln!(handle, "{json}");
            let _ = handle.flush();
        }
    };

    emit(&WorkerLine::Stage {
        stage: crate::domain::models::execution::ExecutionStage::Setup,
    });
    let data = match crate::infrastructure::data::CsvDataAccessor::load(
        &job.manifest_path,
        &job.data_dir,
    ) {
        Ok(accessor) => accessor,
        Err(e) => {
            emit(&WorkerLine::Failed {
                error_kind: "data".to_string(),
                message: e.to_string(),
                stack_text: None,
            });
            return 0;
        }
    };

    run_pipeline(&job, &data, emit);
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{seed_artifact, StaticAccessor};

    fn job() -> WorkerJob {
        WorkerJob {
            artifact: seed_artifact(),
            manifest_path: String::new(),
            data_dir: String::new(),
            start_date: None,
            end_date: None,
            commission: 0.001_425,
            tax: 0.003,
            rebalance: RebalanceFrequency::Weekly,
        }
    }

    #[test]
    fn test_pipeline_emits_stages_then_done() {
        let data = StaticAccessor::trending(120, 6);
        let mut lines = Vec::new();
        run_pipeline(&job(), &data, |line| lines.push(line.clone()));

        assert!(matches!(
            lines.first(),
            Some(WorkerLine::Stage {
                stage: ExecutionStage::Evaluation
            })
        ));
        assert!(matches!(lines.last(), Some(WorkerLine::Done { .. })));
    }

    #[test]
    fn test_pipeline_reports_evaluation_failure() {
        let data = StaticAccessor::trending(20, 3);
        let mut bad = job();
        bad.artifact = crate::testutil::code_artifact(
            "strategy t { positions = weight_equal(momentum(no_such_key)); }",
        );
        let mut lines = Vec::new();
        run_pipeline(&bad, &data, |line| lines.push(line.clone()));
        assert!(matches!(
            lines.last(),
            Some(WorkerLine::Failed { error_kind, .. }) if error_kind == "evaluation"
        ));
    }

    #[test]
    fn test_job_roundtrips_through_json() {
        let j = job();
        let json = serde_json::to_string(&j).unwrap();
        let back: WorkerJob = serde_json::from_str(&json).unwrap();
        assert_eq!(back.artifact, j.artifact);
    }
}
