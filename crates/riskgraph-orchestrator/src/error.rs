//! Error types for riskgraph-orchestrator.
//!
//! Per-worker failures are not errors here: they travel as data on
//! [`WorkerResult`](crate::worker::WorkerResult) so one failing capability
//! never aborts a task. [`OrchestratorError`] covers the request-level
//! failures a caller must handle.

use thiserror::Error;

use crate::task::TaskId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    /// The request was malformed. Nothing was dispatched.
    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// The task driver stopped without publishing a report.
    #[error("task {0} ended without a report")]
    TaskAbandoned(TaskId),
}

impl OrchestratorError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Failure reported by an [`Analyzer`](crate::worker::Analyzer).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalyzerError {
    #[error("analysis failed: {0}")]
    Failed(String),

    /// The analyzer observed the cancellation token and gave up.
    #[error("analysis cancelled")]
    Cancelled,
}

/// Failure reported by a [`RiskScorer`](crate::scoring::RiskScorer).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScoringError {
    #[error("no score available for '{0}'")]
    NoScore(String),

    /// The scorer answered with a value outside `[0, 1]`.
    #[error("score {score} for '{entity_id}' is outside [0, 1]")]
    OutOfRange { entity_id: String, score: f64 },
}
