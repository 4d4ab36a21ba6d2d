//! Risk-analysis task orchestration.
//!
//! An [`Orchestrator`] accepts [`AnalysisRequest`]s, fans each one out to the
//! [`WorkerPool`] by capability, merges per-worker results under a single
//! deadline, and folds successful findings into the shared dependency graph.

pub mod capability;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod scoring;
pub mod task;
pub mod worker;

pub use capability::{AnalysisSelection, Capability};
pub use config::{OrchestratorConfig, PoolConfig};
pub use error::{AnalyzerError, OrchestratorError, ScoringError};
pub use orchestrator::{Orchestrator, TaskHandle};
pub use report::{AnalysisReport, CascadeReport, EdgeRef, GraphDelta, RejectedUpdate};
pub use scoring::{MaxReportedScore, RiskScorer, ScoringContext};
pub use task::{AnalysisRequest, AnalysisTask, TaskId, TaskStatus};
pub use worker::{
    AnalysisPayload, Analyzer, Assignment, DiscoveredRelationship, ErrorDetail, ErrorKind,
    Worker, WorkerMetrics, WorkerOutcome, WorkerPool, WorkerResult, WorkerRuntime, WorkerState,
    WorkerStatus,
};
