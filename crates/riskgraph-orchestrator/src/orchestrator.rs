//! Task acceptance, fan-out to workers, and result aggregation.
//!
//! Each accepted request gets a driver task that dispatches one assignment
//! per selected capability, merges results as they arrive, applies the
//! successful findings to the shared graph in a single write, optionally
//! runs cascade queries on the new generation, and publishes an
//! [`AnalysisReport`] to every waiting [`TaskHandle`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use riskgraph_cascade::{CascadeEngine, ClusterMethod};
use riskgraph_core::{
    validate_unit_interval, CoreError, DependencyGraph, EntityType, NodeUpsert, Relationship,
    SharedGraph,
};

use crate::capability::Capability;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, ScoringError};
use crate::report::{AnalysisReport, CascadeReport, EdgeRef, GraphDelta, RejectedUpdate};
use crate::scoring::{MaxReportedScore, RiskScorer, ScoringContext};
use crate::task::{unix_millis, AnalysisRequest, AnalysisTask, Fingerprint, TaskId, TaskStatus};
use crate::worker::{
    Assignment, DiscoveredRelationship, ErrorKind, WorkerOutcome, WorkerPool, WorkerResult,
    WorkerStatus,
};

#[derive(Clone)]
enum ReportState {
    Pending,
    Ready(Arc<AnalysisReport>),
    Abandoned,
}

struct HandleInner {
    task_id: TaskId,
    record: Mutex<AnalysisTask>,
    cancel: CancellationToken,
    report: watch::Sender<ReportState>,
}

/// Shared view of one task. Duplicate submissions receive clones of the
/// same handle.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<HandleInner>,
}

impl TaskHandle {
    fn new(task: AnalysisTask, cancel: CancellationToken) -> Self {
        let (report, _) = watch::channel(ReportState::Pending);
        TaskHandle {
            inner: Arc::new(HandleInner {
                task_id: task.task_id,
                record: Mutex::new(task),
                cancel,
                report,
            }),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.inner.task_id
    }

    pub fn status(&self) -> TaskStatus {
        self.lock().status
    }

    /// A copy of the task record as it stands now.
    pub fn snapshot(&self) -> AnalysisTask {
        self.lock().clone()
    }

    /// Cancels outstanding assignments. Results already received are kept
    /// and the task still produces a report.
    pub fn cancel(&self) {
        tracing::info!(task_id = %self.inner.task_id, "task cancellation requested");
        self.inner.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// The report, if the task has finished.
    pub fn report(&self) -> Option<Arc<AnalysisReport>> {
        match &*self.inner.report.borrow() {
            ReportState::Ready(report) => Some(report.clone()),
            _ => None,
        }
    }

    /// Waits for the report.
    pub async fn wait(&self) -> Result<Arc<AnalysisReport>, OrchestratorError> {
        let abandoned = OrchestratorError::TaskAbandoned(self.inner.task_id);
        let mut rx = self.inner.report.subscribe();
        let state = rx
            .wait_for(|s| !matches!(s, ReportState::Pending))
            .await
            .map_err(|_| abandoned.clone())?;
        match &*state {
            ReportState::Ready(report) => Ok(report.clone()),
            _ => Err(abandoned),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AnalysisTask> {
        self.inner.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<T>(&self, f: impl FnOnce(&mut AnalysisTask) -> T) -> T {
        f(&mut self.lock())
    }

    fn publish(&self, report: AnalysisReport) {
        self.inner.report.send_replace(ReportState::Ready(Arc::new(report)));
    }

    fn abandon(&self) {
        self.inner.report.send_if_modified(|state| {
            if matches!(state, ReportState::Pending) {
                *state = ReportState::Abandoned;
                true
            } else {
                false
            }
        });
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("task_id", &self.inner.task_id)
            .field("status", &self.status())
            .finish()
    }
}

struct Inner {
    config: OrchestratorConfig,
    pool: Arc<WorkerPool>,
    graph: Arc<SharedGraph>,
    scorer: Arc<dyn RiskScorer>,
    cascade: CascadeEngine,
    in_flight: DashMap<Fingerprint, TaskHandle>,
    tasks: DashMap<TaskId, TaskHandle>,
    shutdown: CancellationToken,
}

/// Accepts analysis requests and drives them to completion.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        pool: Arc<WorkerPool>,
        graph: Arc<SharedGraph>,
    ) -> Result<Self, OrchestratorError> {
        Self::with_scorer(config, pool, graph, Arc::new(MaxReportedScore))
    }

    pub fn with_scorer(
        config: OrchestratorConfig,
        pool: Arc<WorkerPool>,
        graph: Arc<SharedGraph>,
        scorer: Arc<dyn RiskScorer>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let cascade = CascadeEngine::new(config.cascade.clone())
            .map_err(|e| OrchestratorError::Config(format!("cascade: {e}")))?;
        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                pool,
                graph,
                scorer,
                cascade,
                in_flight: DashMap::new(),
                tasks: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.inner.pool
    }

    pub fn graph(&self) -> &Arc<SharedGraph> {
        &self.inner.graph
    }

    /// Accepts a request and starts its driver.
    ///
    /// A request whose entity and selection match a task still in flight
    /// attaches to that task instead of starting another. Must be called
    /// from within a tokio runtime.
    pub fn submit(&self, request: AnalysisRequest) -> Result<TaskHandle, OrchestratorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        request.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            OrchestratorError::Config("submit requires a running tokio runtime".into())
        })?;

        let capabilities = request.selection.resolve(&self.inner.pool.capabilities());
        if capabilities.is_empty() {
            return Err(OrchestratorError::validation(
                "selection",
                "no capabilities are registered",
            ));
        }
        let deadline = request
            .deadline_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.inner.config.default_deadline());

        let fingerprint = Fingerprint::new(&request.entity_id, &capabilities);
        let handle = match self.inner.in_flight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                tracing::info!(task_id = %handle.task_id(), entity_id = %request.entity_id, "attached to in-flight task");
                return Ok(handle);
            }
            Entry::Vacant(entry) => {
                let task = AnalysisTask::new(&request, capabilities, deadline);
                let handle = TaskHandle::new(task, self.inner.shutdown.child_token());
                entry.insert(handle.clone());
                handle
            }
        };
        self.inner.tasks.insert(handle.task_id(), handle.clone());

        tracing::info!(
            task_id = %handle.task_id(),
            entity_id = %request.entity_id,
            capabilities = handle.snapshot().capabilities.len(),
            deadline_ms = deadline.as_millis() as u64,
            "accepted analysis task"
        );
        runtime.spawn(drive(
            self.inner.clone(),
            handle.clone(),
            fingerprint,
            request,
            Instant::now() + deadline,
        ));
        Ok(handle)
    }

    /// Submits and waits for the report.
    pub async fn analyze(
        &self,
        request: AnalysisRequest,
    ) -> Result<Arc<AnalysisReport>, OrchestratorError> {
        self.submit(request)?.wait().await
    }

    /// Submits every request up front, then waits for all of them. Results
    /// keep the input order.
    pub async fn analyze_batch(
        &self,
        requests: impl IntoIterator<Item = AnalysisRequest>,
    ) -> Vec<Result<Arc<AnalysisReport>, OrchestratorError>> {
        let waits: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let submitted = self.submit(request);
                async move { submitted?.wait().await }
            })
            .collect();
        futures::future::join_all(waits).await
    }

    pub fn task(&self, task_id: TaskId) -> Option<TaskHandle> {
        self.inner.tasks.get(&task_id).map(|entry| entry.value().clone())
    }

    /// Every retained task record, oldest first.
    pub fn tasks(&self) -> Vec<AnalysisTask> {
        let mut tasks: Vec<AnalysisTask> = self
            .inner
            .tasks
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.task_id));
        tasks
    }

    /// Drops a finished task's record. Running tasks are kept.
    pub fn evict(&self, task_id: TaskId) -> bool {
        self.inner
            .tasks
            .remove_if(&task_id, |_, handle| handle.status().is_terminal())
            .is_some()
    }

    pub fn worker_statuses(&self) -> Vec<WorkerStatus> {
        self.inner.pool.list()
    }

    /// Rejects new requests, cancels running tasks and stops every worker.
    pub fn shutdown(&self) {
        tracing::info!(in_flight = self.inner.in_flight.len(), "orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.pool.stop_all();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// Releases the fingerprint and unblocks waiters however the driver exits.
struct DriverGuard {
    inner: Arc<Inner>,
    handle: TaskHandle,
    fingerprint: Fingerprint,
}

impl DriverGuard {
    fn release(&self) {
        let task_id = self.handle.task_id();
        self.inner
            .in_flight
            .remove_if(&self.fingerprint, |_, h| h.task_id() == task_id);
    }
}

impl Drop for DriverGuard {
    fn drop(&mut self) {
        self.release();
        self.handle.abandon();
    }
}

async fn drive(
    inner: Arc<Inner>,
    handle: TaskHandle,
    fingerprint: Fingerprint,
    request: AnalysisRequest,
    deadline: Instant,
) {
    let guard = DriverGuard {
        inner: inner.clone(),
        handle: handle.clone(),
        fingerprint,
    };
    let report = run_task(&inner, &handle, &request, deadline).await;
    // Later requests start a fresh task once the report is visible.
    guard.release();
    handle.publish(report);
}

async fn run_task(
    inner: &Arc<Inner>,
    handle: &TaskHandle,
    request: &AnalysisRequest,
    deadline: Instant,
) -> AnalysisReport {
    let task_id = handle.task_id();
    let cancel = handle.inner.cancel.clone();
    let capabilities = handle.update(|task| {
        task.advance(TaskStatus::Dispatched);
        task.capabilities.clone()
    });

    let mut pending: FuturesUnordered<_> = capabilities
        .into_iter()
        .map(|capability| {
            let assignment = Assignment {
                task_id,
                entity_id: request.entity_id.clone(),
                entity_type: request.entity_type.clone(),
                capability,
                parameters: request.parameters.clone(),
                attempt: 0,
            };
            run_capability(inner.clone(), assignment, deadline, cancel.clone())
        })
        .collect();

    let collect = async {
        while let Some(result) = pending.next().await {
            tracing::debug!(
                %task_id,
                capability = %result.capability,
                outcome = ?result.outcome,
                "received worker result"
            );
            handle.update(|task| task.record(result));
        }
    };
    if tokio::time::timeout_at(deadline, collect).await.is_err() {
        tracing::warn!(%task_id, "task deadline reached with results outstanding");
    }

    let task = handle.update(|task| {
        let missing: Vec<Capability> = task
            .capabilities
            .iter()
            .filter(|c| !task.results.contains_key(*c))
            .cloned()
            .collect();
        for capability in missing {
            let started_at = task.created_at;
            task.record(WorkerResult::timed_out(
                None,
                capability,
                started_at,
                cancel.is_cancelled(),
            ));
        }
        let status = task.final_status();
        task.advance(status);
        task.clone()
    });

    tracing::info!(
        %task_id,
        status = ?task.status,
        succeeded = task.count(WorkerOutcome::Success),
        failed = task.count(WorkerOutcome::Error),
        timed_out = task.count(WorkerOutcome::TimedOut),
        "task finished"
    );

    let completed = task.status == TaskStatus::Completed;
    let (entity_score, graph_delta) = if completed {
        apply_results(inner, &task)
    } else {
        (
            None,
            GraphDelta {
                generation: inner.graph.generation(),
                ..Default::default()
            },
        )
    };
    let cascade = (completed && inner.config.run_cascade_on_completion)
        .then(|| run_cascade(inner, request));

    AnalysisReport {
        degraded: completed && task.is_degraded(),
        task,
        entity_score,
        graph_delta,
        cascade,
    }
}

/// Dispatches one capability, re-dispatching worker errors up to the
/// configured retry count while the task deadline allows.
async fn run_capability(
    inner: Arc<Inner>,
    mut assignment: Assignment,
    deadline: Instant,
    cancel: CancellationToken,
) -> WorkerResult {
    loop {
        let call_deadline = match inner.config.worker_timeout() {
            Some(limit) => deadline.min(Instant::now() + limit),
            None => deadline,
        };
        let mut result = inner
            .pool
            .dispatch(assignment.clone(), call_deadline, cancel.clone())
            .await;
        result.attempts = assignment.attempt + 1;

        let retry = result.error_kind() == Some(ErrorKind::WorkerError)
            && assignment.attempt < inner.config.max_retries
            && !cancel.is_cancelled()
            && Instant::now() < deadline;
        if !retry {
            return result;
        }
        tracing::debug!(
            task_id = %assignment.task_id,
            capability = %assignment.capability,
            attempt = assignment.attempt + 1,
            "retrying failed assignment"
        );
        assignment.attempt += 1;
    }
}

/// Writes the merged score and discovered relationships in one graph write.
///
/// Invalid items are reported in [`GraphDelta::rejected`]; every valid item
/// is still applied.
fn apply_results(inner: &Inner, task: &AnalysisTask) -> (Option<f64>, GraphDelta) {
    let mut rejected = Vec::new();
    let score = merged_score(inner, task).unwrap_or_else(|e| {
        tracing::warn!(task_id = %task.task_id, error = %e, "risk score rejected");
        rejected.push(RejectedUpdate {
            capability: None,
            item: format!("risk_score for '{}'", task.entity_id),
            reason: e.to_string(),
        });
        None
    });

    let analyzed_by: Vec<&str> = task.successes().map(|r| r.capability.as_str()).collect();
    let mut node = NodeUpsert::new(task.entity_id.clone())
        .attribute("last_analysis", json!(unix_millis()))
        .attribute("analyzed_by", json!(analyzed_by))
        .attribute("last_task_id", json!(task.task_id.to_string()));
    if task.entity_type != EntityType::Unknown {
        node = node.entity_type(task.entity_type.clone());
    }
    if let Some(score) = score {
        node = node.risk_score(score);
    }

    let written = inner.graph.write(|graph| {
        let mut delta = GraphDelta::default();
        match graph.upsert_node(node) {
            Ok(_) => delta.nodes_upserted.push(task.entity_id.clone()),
            Err(e) => delta.rejected.push(RejectedUpdate {
                capability: None,
                item: format!("entity '{}'", task.entity_id),
                reason: e.to_string(),
            }),
        }
        for result in task.successes() {
            let Some(payload) = &result.payload else {
                continue;
            };
            for found in &payload.relationships {
                if let Err(e) = merge_relationship(graph, &task.entity_id, found, &mut delta) {
                    let source = found.source_id.as_deref().unwrap_or(&task.entity_id);
                    delta.rejected.push(RejectedUpdate {
                        capability: Some(result.capability.clone()),
                        item: format!(
                            "{source} -[{}]-> {}",
                            found.relationship_type, found.target_id
                        ),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok::<_, CoreError>(delta)
    });

    let mut delta = written.unwrap_or_else(|e| {
        tracing::error!(task_id = %task.task_id, error = %e, "graph update failed");
        GraphDelta {
            rejected: vec![RejectedUpdate {
                capability: None,
                item: format!("graph update for '{}'", task.entity_id),
                reason: e.to_string(),
            }],
            ..Default::default()
        }
    });
    rejected.append(&mut delta.rejected);
    delta.rejected = rejected;
    delta.generation = inner.graph.generation();

    tracing::info!(
        task_id = %task.task_id,
        generation = delta.generation,
        nodes = delta.nodes_upserted.len(),
        edges = delta.edges_upserted.len(),
        stubs = delta.stub_nodes_created.len(),
        rejected = delta.rejected.len(),
        "applied analysis results to graph"
    );

    let applied = delta.nodes_upserted.iter().any(|id| *id == task.entity_id);
    (score.filter(|_| applied), delta)
}

/// `Ok(None)` when no worker reported a score.
fn merged_score(inner: &Inner, task: &AnalysisTask) -> Result<Option<f64>, ScoringError> {
    let reported: BTreeMap<Capability, f64> = task
        .successes()
        .filter_map(|r| Some((r.capability.clone(), r.payload.as_ref()?.risk_score?)))
        .collect();
    if reported.is_empty() {
        return Ok(None);
    }
    let context = ScoringContext {
        entity_type: task.entity_type.clone(),
        reported,
        previous: inner
            .graph
            .snapshot()
            .get_node(&task.entity_id)
            .map(|e| e.risk_score),
    };
    let score = inner.scorer.score(&task.entity_id, &context)?;
    if validate_unit_interval("risk_score", score).is_err() {
        return Err(ScoringError::OutOfRange {
            entity_id: task.entity_id.clone(),
            score,
        });
    }
    Ok(Some(score))
}

fn merge_relationship(
    graph: &mut DependencyGraph,
    entity_id: &str,
    found: &DiscoveredRelationship,
    delta: &mut GraphDelta,
) -> Result<(), CoreError> {
    let source = found.source_id.clone().unwrap_or_else(|| entity_id.to_string());
    let mut relationship = Relationship::new(
        source,
        found.target_id.clone(),
        found.relationship_type.clone(),
        found.weight,
    );
    relationship.attributes = found.attributes.clone();
    relationship.validate()?;

    if let Some(target_type) = &found.target_type {
        let known = graph
            .get_node(&found.target_id)
            .is_some_and(|entity| !entity.stub);
        if !known {
            graph.upsert_node(
                NodeUpsert::new(found.target_id.clone()).entity_type(target_type.clone()),
            )?;
            delta.nodes_upserted.push(found.target_id.clone());
        }
    }

    let edge = EdgeRef {
        source_id: relationship.source_id.clone(),
        target_id: relationship.target_id.clone(),
        relationship_type: relationship.relationship_type.clone(),
    };
    let outcome = graph.upsert_edge(relationship)?;
    delta.stub_nodes_created.extend(outcome.stubbed);
    delta.edges_upserted.push(edge);
    Ok(())
}

fn run_cascade(inner: &Inner, request: &AnalysisRequest) -> CascadeReport {
    let snapshot = inner.graph.snapshot();
    let engine = &inner.cascade;
    let config = &inner.config;
    let origin = request.entity_id.as_str();
    let mut report = CascadeReport {
        generation: snapshot.generation(),
        ..Default::default()
    };

    let shock = request
        .shock
        .or_else(|| snapshot.get_node(origin).map(|e| e.risk_score))
        .unwrap_or(0.0);
    match engine.propagate(&snapshot, origin, shock) {
        Ok(result) => report.propagation = Some(result),
        Err(e) => report.errors.push(format!("propagation: {e}")),
    }

    if config.critical_path_count > 0 {
        match engine.critical_paths(&snapshot, origin, config.critical_path_count) {
            Ok(paths) => report.critical_paths = paths,
            Err(e) => report.errors.push(format!("critical paths: {e}")),
        }
    }

    match engine.hotspots(&snapshot, config.hotspot_count) {
        Ok(hotspots) => report.hotspots = hotspots,
        Err(e) => report.errors.push(format!("hotspots: {e}")),
    }

    if request.include_clusters {
        match engine.clusters(&snapshot, ClusterMethod::Louvain) {
            Ok(clusters) => report.clusters = Some(clusters),
            Err(e) => report.errors.push(format!("clusters: {e}")),
        }
    }

    for target in &request.path_targets {
        match engine.paths(&snapshot, origin, target) {
            Ok(search) => {
                let paths = search.iter().take(config.paths_per_target).cloned().collect();
                report.paths.insert(target.clone(), paths);
            }
            Err(e) => report.errors.push(format!("paths to '{target}': {e}")),
        }
    }

    if !report.errors.is_empty() {
        tracing::warn!(origin, errors = report.errors.len(), "cascade queries reported errors");
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn handle() -> TaskHandle {
        let task = AnalysisTask::new(
            &AnalysisRequest::new("acme"),
            BTreeSet::from([Capability::new("credit")]),
            Duration::from_secs(1),
        );
        TaskHandle::new(task, CancellationToken::new())
    }

    #[tokio::test]
    async fn abandoned_task_unblocks_waiters() {
        let handle = handle();
        handle.abandon();
        assert!(matches!(
            handle.wait().await,
            Err(OrchestratorError::TaskAbandoned(id)) if id == handle.task_id()
        ));
        assert!(handle.report().is_none());
    }

    #[test]
    fn abandon_does_not_replace_a_report() {
        let handle = handle();
        let task = handle.snapshot();
        handle.publish(AnalysisReport {
            task,
            degraded: false,
            entity_score: None,
            graph_delta: GraphDelta::default(),
            cascade: None,
        });
        handle.abandon();
        assert!(handle.report().is_some());
    }
}
