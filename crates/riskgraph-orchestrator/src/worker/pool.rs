//! Capability-routed worker registry with a global concurrency bound.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capability::Capability;
use crate::config::PoolConfig;
use crate::error::OrchestratorError;
use crate::task::unix_millis;
use crate::worker::{Assignment, ErrorKind, Worker, WorkerResult, WorkerState, WorkerStatus};

/// Pending result of [`WorkerPool::dispatch`].
pub type Dispatch = BoxFuture<'static, WorkerResult>;

/// Registered workers grouped by capability.
///
/// At most `max_concurrent_workers` assignments run at once; the rest queue
/// in FIFO order. The deadline passed to [`dispatch`](Self::dispatch) covers
/// both the queue wait and the analysis.
pub struct WorkerPool {
    workers: DashMap<Capability, Vec<Arc<dyn Worker>>>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    cursor: AtomicUsize,
}

impl WorkerPool {
    pub fn new(config: &PoolConfig) -> Self {
        WorkerPool {
            workers: DashMap::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_workers)),
            max_concurrent: config.max_concurrent_workers,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Adds a worker under its capability. Worker ids are unique pool-wide.
    pub fn register(&self, worker: Arc<dyn Worker>) -> Result<(), OrchestratorError> {
        if self.find(worker.id()).is_some() {
            return Err(OrchestratorError::validation(
                "worker_id",
                format!("worker '{}' is already registered", worker.id()),
            ));
        }
        tracing::info!(worker_id = %worker.id(), capability = %worker.capability(), "registered worker");
        self.workers
            .entry(worker.capability().clone())
            .or_default()
            .push(worker);
        Ok(())
    }

    /// Removes a worker. In-flight work on it is not interrupted.
    pub fn deregister(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        let mut removed = None;
        self.workers.retain(|_, list| {
            if let Some(pos) = list.iter().position(|w| w.id() == worker_id) {
                removed = Some(list.remove(pos));
            }
            !list.is_empty()
        });
        if removed.is_some() {
            tracing::info!(worker_id, "deregistered worker");
        }
        removed
    }

    pub fn find(&self, worker_id: &str) -> Option<Arc<dyn Worker>> {
        self.workers
            .iter()
            .find_map(|entry| entry.value().iter().find(|w| w.id() == worker_id).cloned())
    }

    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.workers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.workers.contains_key(capability)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Status of every worker, ordered by capability then id.
    pub fn list(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> = self
            .workers
            .iter()
            .flat_map(|entry| entry.value().iter().map(|w| w.status()).collect::<Vec<_>>())
            .collect();
        statuses.sort_by(|a, b| {
            a.capability
                .cmp(&b.capability)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        statuses
    }

    pub fn stop_all(&self) {
        for entry in self.workers.iter() {
            for worker in entry.value() {
                worker.stop();
            }
        }
    }

    /// Starts one assignment and returns its eventual result.
    ///
    /// Never blocks: the work is spawned immediately, and a missing
    /// capability resolves at once to a `CapabilityUnavailable` error
    /// result.
    pub fn dispatch(
        &self,
        assignment: Assignment,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Dispatch {
        let capability = assignment.capability.clone();
        let candidates: Vec<Arc<dyn Worker>> = self
            .workers
            .get(&capability)
            .map(|list| list.value().clone())
            .unwrap_or_default();

        if candidates.is_empty() {
            tracing::warn!(%capability, task_id = %assignment.task_id, "no worker registered for capability");
            return future::ready(WorkerResult::capability_unavailable(capability)).boxed();
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(run_assignment(
            candidates,
            start,
            self.permits.clone(),
            assignment,
            deadline,
            cancel,
        ));

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => WorkerResult::error(
                    None,
                    capability,
                    ErrorKind::WorkerError,
                    format!("worker task failed: {e}"),
                    unix_millis(),
                ),
            }
        }
        .boxed()
    }
}

async fn run_assignment(
    candidates: Vec<Arc<dyn Worker>>,
    start: usize,
    permits: Arc<Semaphore>,
    assignment: Assignment,
    deadline: Instant,
    cancel: CancellationToken,
) -> WorkerResult {
    let started_at = unix_millis();
    let capability = assignment.capability.clone();
    let task_id = assignment.task_id;
    let mut picked: Option<String> = None;

    let run = async {
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return WorkerResult::timed_out(None, capability.clone(), started_at, true);
            }
            permit = permits.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return WorkerResult::error(
                        None,
                        capability.clone(),
                        ErrorKind::WorkerStopped,
                        "worker pool is closed",
                        started_at,
                    );
                }
            },
        };

        let Some(worker) = choose(&candidates, start) else {
            return WorkerResult::error(
                None,
                capability.clone(),
                ErrorKind::WorkerStopped,
                format!("every worker for '{capability}' is stopped"),
                started_at,
            );
        };
        picked = Some(worker.id().to_string());
        tracing::debug!(worker_id = %worker.id(), %capability, %task_id, "dispatching assignment");
        worker.submit(assignment, cancel.clone()).await
    };

    let outcome = tokio::time::timeout_at(deadline, run).await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(%capability, %task_id, worker_id = ?picked, "assignment deadline exceeded");
            WorkerResult::timed_out(picked, capability, started_at, false)
        }
    }
}

/// Prefers an idle worker, starting from the round-robin cursor, then any
/// worker that is not stopped.
fn choose(candidates: &[Arc<dyn Worker>], start: usize) -> Option<&Arc<dyn Worker>> {
    let n = candidates.len();
    let rotation = || (0..n).map(move |i| &candidates[(start + i) % n]);
    rotation()
        .find(|w| w.state() == WorkerState::Idle)
        .or_else(|| rotation().find(|w| w.state() != WorkerState::Stopped))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::AnalyzerError;
    use crate::task::TaskId;
    use crate::worker::{AnalysisPayload, Analyzer, WorkerOutcome, WorkerRuntime};
    use riskgraph_core::EntityType;

    /// Sleeps, recording the peak number of concurrent analyses.
    struct Counting {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Analyzer for Counting {
        async fn analyze(
            &self,
            _: &Assignment,
            _: &CancellationToken,
        ) -> Result<AnalysisPayload, AnalyzerError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(AnalysisPayload::with_score(0.1))
        }
    }

    fn counting(delay: Duration) -> (Counting, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let analyzer = Counting {
            active: Arc::new(AtomicUsize::new(0)),
            peak: peak.clone(),
            delay,
        };
        (analyzer, peak)
    }

    fn assignment(capability: &str) -> Assignment {
        Assignment {
            task_id: TaskId::new(),
            entity_id: "acme".into(),
            entity_type: EntityType::Company,
            capability: Capability::new(capability),
            parameters: serde_json::Value::Null,
            attempt: 0,
        }
    }

    fn pool(max_concurrent_workers: usize) -> WorkerPool {
        WorkerPool::new(&PoolConfig {
            max_concurrent_workers,
            ..Default::default()
        })
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn missing_capability_resolves_immediately() {
        let pool = pool(2);
        let result = pool
            .dispatch(assignment("market"), far(), CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::CapabilityUnavailable));
    }

    #[tokio::test]
    async fn registry_rejects_duplicates_and_deregisters() {
        let pool = pool(2);
        let (a, _) = counting(Duration::ZERO);
        let (b, _) = counting(Duration::ZERO);
        pool.register(Arc::new(WorkerRuntime::new("w1", "credit", a))).unwrap();
        assert!(pool
            .register(Arc::new(WorkerRuntime::new("w1", "market", b)))
            .is_err());
        assert!(pool.has_capability(&Capability::new("credit")));
        assert_eq!(pool.list().len(), 1);

        assert!(pool.deregister("w1").is_some());
        assert!(pool.deregister("w1").is_none());
        assert!(pool.capabilities().is_empty());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = pool(2);
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        for i in 0..4 {
            let analyzer = Counting {
                active: active.clone(),
                peak: peak.clone(),
                delay: Duration::from_millis(30),
            };
            pool.register(Arc::new(WorkerRuntime::new(format!("w{i}"), "credit", analyzer)))
                .unwrap();
        }

        let dispatches: Vec<_> = (0..4)
            .map(|_| pool.dispatch(assignment("credit"), far(), CancellationToken::new()))
            .collect();
        let results = futures::future::join_all(dispatches).await;
        assert!(results.iter().all(|r| r.is_success()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn deadline_covers_execution() {
        let pool = pool(1);
        let (slow, _) = counting(Duration::from_secs(10));
        pool.register(Arc::new(WorkerRuntime::new("slow", "credit", slow)))
            .unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        let result = pool
            .dispatch(assignment("credit"), deadline, CancellationToken::new())
            .await;
        assert_eq!(result.outcome, WorkerOutcome::TimedOut);
        assert!(!result.cancelled);
        assert_eq!(result.worker_id.as_deref(), Some("slow"));
    }

    #[tokio::test]
    async fn stopped_workers_are_skipped() {
        let pool = pool(2);
        let (a, _) = counting(Duration::ZERO);
        let (b, _) = counting(Duration::ZERO);
        pool.register(Arc::new(WorkerRuntime::new("w1", "credit", a))).unwrap();
        pool.register(Arc::new(WorkerRuntime::new("w2", "credit", b))).unwrap();
        pool.find("w1").unwrap().stop();

        for _ in 0..3 {
            let result = pool
                .dispatch(assignment("credit"), far(), CancellationToken::new())
                .await;
            assert_eq!(result.worker_id.as_deref(), Some("w2"));
        }

        pool.stop_all();
        let result = pool
            .dispatch(assignment("credit"), far(), CancellationToken::new())
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerStopped));
    }
}
