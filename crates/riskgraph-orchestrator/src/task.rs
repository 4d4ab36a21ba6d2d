//! Analysis requests and the task records that track them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use riskgraph_core::EntityType;

use crate::capability::{AnalysisSelection, Capability};
use crate::error::OrchestratorError;
use crate::worker::{WorkerOutcome, WorkerResult};

/// Milliseconds since the Unix epoch; zero if the clock is before it.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle. Transitions only move forward:
///
/// ```text
/// Pending -> Dispatched -> PartialResults{n} -> Completed | Failed | TimedOut
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    PartialResults { received: usize },
    Completed,
    Failed,
    TimedOut,
}

impl TaskStatus {
    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Dispatched => 1,
            TaskStatus::PartialResults { .. } => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    pub fn can_advance_to(&self, next: &TaskStatus) -> bool {
        match (self, next) {
            (
                TaskStatus::PartialResults { received: a },
                TaskStatus::PartialResults { received: b },
            ) => b > a,
            _ => next.rank() > self.rank(),
        }
    }
}

/// A caller's request to analyze one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub entity_id: String,
    #[serde(default = "unknown_type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub selection: AnalysisSelection,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Overall deadline; the configured default applies when absent.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    /// Shock for the post-update propagation. Defaults to the entity's
    /// updated risk score.
    #[serde(default)]
    pub shock: Option<f64>,
    /// Entities to search influence paths towards after the update.
    #[serde(default)]
    pub path_targets: Vec<String>,
    /// Also run Louvain clustering after the update.
    #[serde(default)]
    pub include_clusters: bool,
}

fn unknown_type() -> EntityType {
    EntityType::Unknown
}

impl AnalysisRequest {
    pub fn new(entity_id: impl Into<String>) -> Self {
        AnalysisRequest {
            entity_id: entity_id.into(),
            entity_type: EntityType::Unknown,
            selection: AnalysisSelection::All,
            parameters: serde_json::Value::Null,
            deadline_ms: None,
            shock: None,
            path_targets: Vec::new(),
            include_clusters: false,
        }
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = entity_type;
        self
    }

    pub fn selection(mut self, selection: AnalysisSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn shock(mut self, shock: f64) -> Self {
        self.shock = Some(shock);
        self
    }

    pub fn path_target(mut self, target: impl Into<String>) -> Self {
        self.path_targets.push(target.into());
        self
    }

    pub fn include_clusters(mut self, include: bool) -> Self {
        self.include_clusters = include;
        self
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.entity_id.trim().is_empty() {
            return Err(OrchestratorError::validation("entity_id", "must not be empty"));
        }
        if self.selection.is_empty() {
            return Err(OrchestratorError::validation(
                "selection",
                "must name at least one capability",
            ));
        }
        if self.deadline_ms == Some(0) {
            return Err(OrchestratorError::validation(
                "deadline_ms",
                "must be greater than zero",
            ));
        }
        if let Some(shock) = self.shock {
            riskgraph_core::validate_unit_interval("shock", shock)
                .map_err(|e| OrchestratorError::validation("shock", e.to_string()))?;
        }
        if self.path_targets.iter().any(|t| t.trim().is_empty()) {
            return Err(OrchestratorError::validation(
                "path_targets",
                "must not contain empty ids",
            ));
        }
        Ok(())
    }
}

/// Identity used to collapse duplicate in-flight requests: the entity and
/// the capabilities its selection resolved to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Fingerprint {
    entity_id: String,
    capabilities: BTreeSet<Capability>,
}

impl Fingerprint {
    pub(crate) fn new(entity_id: &str, capabilities: &BTreeSet<Capability>) -> Self {
        Fingerprint {
            entity_id: entity_id.to_string(),
            capabilities: capabilities.clone(),
        }
    }
}

/// The record of one accepted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub task_id: TaskId,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub selection: AnalysisSelection,
    /// Capabilities resolved at acceptance time.
    pub capabilities: BTreeSet<Capability>,
    pub status: TaskStatus,
    /// Unix milliseconds.
    pub created_at: u64,
    pub deadline_at: u64,
    pub results: BTreeMap<Capability, WorkerResult>,
}

impl AnalysisTask {
    pub(crate) fn new(
        request: &AnalysisRequest,
        capabilities: BTreeSet<Capability>,
        deadline: Duration,
    ) -> Self {
        let created_at = unix_millis();
        AnalysisTask {
            task_id: TaskId::new(),
            entity_id: request.entity_id.clone(),
            entity_type: request.entity_type.clone(),
            selection: request.selection.clone(),
            capabilities,
            status: TaskStatus::Pending,
            created_at,
            deadline_at: created_at + deadline.as_millis() as u64,
            results: BTreeMap::new(),
        }
    }

    /// Applies `next` if it moves the lifecycle forward.
    pub(crate) fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_advance_to(&next) {
            tracing::debug!(task_id = %self.task_id, from = ?self.status, to = ?next, "ignored status regression");
            return false;
        }
        self.status = next;
        true
    }

    /// Stores a result, keeping the first one per capability.
    pub(crate) fn record(&mut self, result: WorkerResult) {
        self.results.entry(result.capability.clone()).or_insert(result);
        let received = self.results.len();
        self.advance(TaskStatus::PartialResults { received });
    }

    pub fn count(&self, outcome: WorkerOutcome) -> usize {
        self.results.values().filter(|r| r.outcome == outcome).count()
    }

    pub fn successes(&self) -> impl Iterator<Item = &WorkerResult> {
        self.results.values().filter(|r| r.is_success())
    }

    /// Terminal status for the collected results.
    ///
    /// Any success completes the task. With no success, all-timeout is
    /// `TimedOut` and everything else is `Failed`.
    pub(crate) fn final_status(&self) -> TaskStatus {
        let total = self.results.len();
        if self.count(WorkerOutcome::Success) > 0 {
            TaskStatus::Completed
        } else if total > 0 && self.count(WorkerOutcome::TimedOut) == total {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        }
    }

    /// `true` when a completed task is missing some capability's result.
    pub fn is_degraded(&self) -> bool {
        self.results.values().any(|r| !r.is_success())
    }
}
