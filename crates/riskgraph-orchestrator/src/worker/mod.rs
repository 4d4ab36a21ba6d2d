//! Workers: the units that run one capability's analysis for one task.
//!
//! An [`Analyzer`] is the pluggable analysis body. [`WorkerRuntime`] wraps an
//! analyzer with the state machine, metrics and cancellation handling every
//! worker needs, and [`WorkerPool`] routes assignments to registered
//! workers by capability.

pub mod pool;
pub mod result;
pub mod runtime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use riskgraph_core::{Attributes, EntityType, RelationshipType};

use crate::capability::Capability;
use crate::error::AnalyzerError;
use crate::task::TaskId;

pub use pool::{Dispatch, WorkerPool};
pub use result::{ErrorDetail, ErrorKind, WorkerOutcome, WorkerResult};
pub use runtime::WorkerRuntime;

/// One unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub capability: Capability,
    /// Free-form request parameters, passed through untouched.
    pub parameters: serde_json::Value,
    /// Zero for the first dispatch, incremented on each retry.
    pub attempt: u32,
}

/// What an analyzer found.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    /// Risk score for the analyzed entity, in `[0, 1]`.
    #[serde(default)]
    pub risk_score: Option<f64>,
    /// Relationships to merge into the dependency graph.
    #[serde(default)]
    pub relationships: Vec<DiscoveredRelationship>,
    /// Capability-specific findings, reported verbatim.
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AnalysisPayload {
    pub fn with_score(score: f64) -> Self {
        AnalysisPayload {
            risk_score: Some(score),
            ..Default::default()
        }
    }

    pub fn relationship(mut self, relationship: DiscoveredRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }
}

/// A relationship reported by an analyzer.
///
/// The source defaults to the analyzed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredRelationship {
    #[serde(default)]
    pub source_id: Option<String>,
    pub target_id: String,
    /// Type for the target node when it does not exist yet.
    #[serde(default)]
    pub target_type: Option<EntityType>,
    #[serde(default)]
    pub relationship_type: RelationshipType,
    pub weight: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

impl DiscoveredRelationship {
    pub fn new(target_id: impl Into<String>, relationship_type: RelationshipType, weight: f64) -> Self {
        DiscoveredRelationship {
            source_id: None,
            target_id: target_id.into(),
            target_type: None,
            relationship_type,
            weight,
            attributes: Attributes::new(),
        }
    }

    pub fn from_source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn target_type(mut self, entity_type: EntityType) -> Self {
        self.target_type = Some(entity_type);
        self
    }
}

/// The analysis body of a worker.
///
/// Implementations should watch `cancel` and return
/// [`AnalyzerError::Cancelled`] promptly; one that ignores it is still cut
/// off at its deadline.
#[async_trait]
pub trait Analyzer: Send + Sync + 'static {
    async fn analyze(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
    ) -> Result<AnalysisPayload, AnalyzerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    /// Last task failed; the worker returns to `Idle` after the backoff.
    Error,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    /// Running mean over processed and failed tasks.
    pub avg_latency_ms: f64,
    /// Unix milliseconds of the last finished task.
    pub last_task_at: Option<u64>,
}

impl WorkerMetrics {
    pub(crate) fn record(&mut self, latency_ms: f64, succeeded: bool, finished_at: u64) {
        if succeeded {
            self.tasks_processed += 1;
        } else {
            self.tasks_failed += 1;
        }
        let n = (self.tasks_processed + self.tasks_failed) as f64;
        self.avg_latency_ms += (latency_ms - self.avg_latency_ms) / n;
        self.last_task_at = Some(finished_at);
    }
}

/// Point-in-time view of one registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub capability: Capability,
    pub state: WorkerState,
    pub metrics: WorkerMetrics,
}

/// A registered worker as the pool sees it.
///
/// `submit` always yields a [`WorkerResult`]; failures are data.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;
    fn capability(&self) -> &Capability;
    async fn submit(&self, assignment: Assignment, cancel: CancellationToken) -> WorkerResult;
    fn state(&self) -> WorkerState;
    fn metrics(&self) -> WorkerMetrics;
    /// Cancels in-flight work and rejects further submissions.
    fn stop(&self);
    /// Returns a stopped worker to `Idle`. `false` if it was not stopped.
    fn restart(&self) -> bool;

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            worker_id: self.id().to_string(),
            capability: self.capability().clone(),
            state: self.state(),
            metrics: self.metrics(),
        }
    }
}
