//! Sandbox execution outcomes.

use serde::{Deserialize, Serialize};

use super::metrics::BacktestReport;

/// Where in the worker pipeline a timeout landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    Setup,
    Evaluation,
    Simulation,
}

/// Resource cap a worker ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Scratch,
}

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        report: BacktestReport,
        execution_time: f64,
    },
    Timeout {
        execution_time: f64,
        stage: ExecutionStage,
    },
    /// Hard rule violation caught before any worker started.
    ValidationFail { violations: Vec<String> },
    RuntimeError {
        error_kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack_text: Option<String>,
    },
    ResourceExceeded { resource: ResourceKind },
}

impl ExecutionResult {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The same outcome with the report payload stripped, suitable for
    /// the per-line iteration log.
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Success { execution_time, .. } => ExecutionStatus::Success {
                execution_time: *execution_time,
            },
            Self::Timeout {
                execution_time,
                stage,
            } => ExecutionStatus::Timeout {
                execution_time: *execution_time,
                stage: *stage,
            },
            Self::ValidationFail { violations } => ExecutionStatus::ValidationFail {
                violations: violations.clone(),
            },
            Self::RuntimeError {
                error_kind,
                message,
                stack_text,
            } => ExecutionStatus::RuntimeError {
                error_kind: error_kind.clone(),
                message: message.clone(),
                stack_text: stack_text.clone(),
            },
            Self::ResourceExceeded { resource } => ExecutionStatus::ResourceExceeded {
                resource: *resource,
            },
        }
    }
}

/// `ExecutionResult` without the backtest payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success {
        execution_time: f64,
    },
    Timeout {
        execution_time: f64,
        stage: ExecutionStage,
    },
    ValidationFail {
        violations: Vec<String>,
    },
    RuntimeError {
        error_kind: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stack_text: Option<String>,
    },
    ResourceExceeded {
        resource: ResourceKind,
    },
}
