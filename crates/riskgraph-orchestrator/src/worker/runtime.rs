//! The standard [`Worker`] implementation around an [`Analyzer`].
//!
//! State machine:
//!
//! ```text
//! Idle --submit--> Busy --ok--> Idle
//!                   |---err--> Error --backoff elapsed--> Idle
//! any --stop--> Stopped --restart--> Idle
//! ```
//!
//! A runtime runs one assignment at a time. Submissions that arrive while
//! it is busy wait their turn; a submission that finds the worker in
//! `Error` waits out the rest of the backoff first.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use riskgraph_core::validate_unit_interval;

use crate::capability::Capability;
use crate::error::AnalyzerError;
use crate::task::unix_millis;
use crate::worker::{
    AnalysisPayload, Analyzer, Assignment, ErrorKind, Worker, WorkerMetrics, WorkerOutcome,
    WorkerResult, WorkerState,
};

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct RuntimeState {
    state: WorkerState,
    error_until: Option<Instant>,
    metrics: WorkerMetrics,
    stop: CancellationToken,
}

impl RuntimeState {
    /// Applies the lazy `Error -> Idle` transition.
    fn refresh(&mut self) {
        if self.state == WorkerState::Error
            && self.error_until.map_or(true, |until| Instant::now() >= until)
        {
            self.state = WorkerState::Idle;
            self.error_until = None;
        }
    }
}

enum Finish {
    Done(Result<AnalysisPayload, AnalyzerError>),
    Cancelled,
    Stopped,
}

pub struct WorkerRuntime<A> {
    id: String,
    capability: Capability,
    analyzer: A,
    backoff: Duration,
    state: Mutex<RuntimeState>,
    slot: tokio::sync::Mutex<()>,
}

impl<A: Analyzer> WorkerRuntime<A> {
    pub fn new(id: impl Into<String>, capability: impl Into<Capability>, analyzer: A) -> Self {
        WorkerRuntime {
            id: id.into(),
            capability: capability.into(),
            analyzer,
            backoff: DEFAULT_BACKOFF,
            state: Mutex::new(RuntimeState {
                state: WorkerState::Idle,
                error_until: None,
                metrics: WorkerMetrics::default(),
                stop: CancellationToken::new(),
            }),
            slot: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn analyzer(&self) -> &A {
        &self.analyzer
    }

    fn lock(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stopped_result(&self, started_at: u64) -> WorkerResult {
        WorkerResult::error(
            Some(self.id.clone()),
            self.capability.clone(),
            ErrorKind::WorkerStopped,
            format!("worker '{}' is stopped", self.id),
            started_at,
        )
    }

    fn cancelled_result(&self, started_at: u64) -> WorkerResult {
        WorkerResult::timed_out(Some(self.id.clone()), self.capability.clone(), started_at, true)
    }

    fn result_for(&self, finish: Finish, started_at: u64) -> WorkerResult {
        match finish {
            Finish::Done(Ok(payload)) => match check_payload(&payload) {
                Ok(()) => WorkerResult::success(
                    self.id.clone(),
                    self.capability.clone(),
                    payload,
                    started_at,
                ),
                Err(reason) => WorkerResult::error(
                    Some(self.id.clone()),
                    self.capability.clone(),
                    ErrorKind::InvalidPayload,
                    reason,
                    started_at,
                ),
            },
            Finish::Done(Err(AnalyzerError::Cancelled)) | Finish::Cancelled => {
                self.cancelled_result(started_at)
            }
            Finish::Done(Err(e)) => WorkerResult::error(
                Some(self.id.clone()),
                self.capability.clone(),
                ErrorKind::WorkerError,
                e.to_string(),
                started_at,
            ),
            Finish::Stopped => self.stopped_result(started_at),
        }
    }

    /// Records one submission in the metrics and, when this submission held
    /// the worker `Busy`, moves the state machine past it.
    ///
    /// Every submission counts exactly once: a success in
    /// `tasks_processed`, anything else in `tasks_failed`.
    fn settle(&self, result: &WorkerResult, latency_ms: f64, held_busy: bool) {
        let mut state = self.lock();
        state
            .metrics
            .record(latency_ms, result.is_success(), result.finished_at);

        if held_busy && state.state == WorkerState::Busy {
            state.state = match result.outcome {
                WorkerOutcome::Error
                    if result.error_kind() != Some(ErrorKind::WorkerStopped)
                        && !self.backoff.is_zero() =>
                {
                    state.error_until = Some(Instant::now() + self.backoff);
                    WorkerState::Error
                }
                _ => WorkerState::Idle,
            };
        }

        tracing::info!(
            worker_id = %self.id,
            capability = %self.capability,
            outcome = ?result.outcome,
            latency_ms,
            tasks_processed = state.metrics.tasks_processed,
            tasks_failed = state.metrics.tasks_failed,
            avg_latency_ms = state.metrics.avg_latency_ms,
            "worker finished assignment"
        );
    }

    /// Waits for the slot and any remaining backoff, then runs the analyzer.
    async fn execute(
        &self,
        assignment: &Assignment,
        cancel: &CancellationToken,
        guard: &mut InFlight<'_>,
    ) -> Finish {
        let stop = {
            let state = self.lock();
            if state.state == WorkerState::Stopped {
                return Finish::Stopped;
            }
            state.stop.clone()
        };

        let _slot = tokio::select! {
            biased;
            _ = stop.cancelled() => return Finish::Stopped,
            _ = cancel.cancelled() => return Finish::Cancelled,
            slot = self.slot.lock() => slot,
        };

        let backoff_until = {
            let mut state = self.lock();
            state.refresh();
            if state.state == WorkerState::Stopped {
                return Finish::Stopped;
            }
            state.error_until
        };
        if let Some(until) = backoff_until {
            tracing::debug!(worker_id = %self.id, "waiting out error backoff");
            tokio::select! {
                biased;
                _ = stop.cancelled() => return Finish::Stopped,
                _ = cancel.cancelled() => return Finish::Cancelled,
                _ = tokio::time::sleep_until(until) => {}
            }
        }

        {
            let mut state = self.lock();
            if state.state == WorkerState::Stopped {
                return Finish::Stopped;
            }
            state.state = WorkerState::Busy;
            state.error_until = None;
        }
        guard.busy = true;

        tokio::select! {
            biased;
            _ = stop.cancelled() => Finish::Stopped,
            _ = cancel.cancelled() => Finish::Cancelled,
            res = self.analyzer.analyze(assignment, cancel) => Finish::Done(res),
        }
    }
}

#[async_trait]
impl<A: Analyzer> Worker for WorkerRuntime<A> {
    fn id(&self) -> &str {
        &self.id
    }

    fn capability(&self) -> &Capability {
        &self.capability
    }

    async fn submit(&self, assignment: Assignment, cancel: CancellationToken) -> WorkerResult {
        let started_at = unix_millis();
        let mut guard = InFlight {
            state: &self.state,
            worker_id: &self.id,
            clock: Instant::now(),
            busy: false,
            armed: true,
        };

        let finish = self.execute(&assignment, &cancel, &mut guard).await;

        guard.armed = false;
        let result = self.result_for(finish, started_at);
        self.settle(&result, guard.latency_ms(), guard.busy);
        result
    }

    fn state(&self) -> WorkerState {
        let mut state = self.lock();
        state.refresh();
        state.state
    }

    fn metrics(&self) -> WorkerMetrics {
        self.lock().metrics.clone()
    }

    fn stop(&self) {
        let mut state = self.lock();
        state.state = WorkerState::Stopped;
        state.error_until = None;
        state.stop.cancel();
        tracing::info!(worker_id = %self.id, capability = %self.capability, "worker stopped");
    }

    fn restart(&self) -> bool {
        let mut state = self.lock();
        if state.state != WorkerState::Stopped {
            return false;
        }
        state.state = WorkerState::Idle;
        state.stop = CancellationToken::new();
        tracing::info!(worker_id = %self.id, capability = %self.capability, "worker restarted");
        true
    }
}

/// Accounts for a `submit` future that is dropped before it finishes, which
/// happens when the pool's deadline fires first. The abandoned submission
/// counts as failed, like any other non-success.
struct InFlight<'a> {
    state: &'a Mutex<RuntimeState>,
    worker_id: &'a str,
    clock: Instant,
    busy: bool,
    armed: bool,
}

impl InFlight<'_> {
    fn latency_ms(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * 1000.0
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let latency_ms = self.latency_ms();
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.metrics.record(latency_ms, false, unix_millis());
        if self.busy && state.state == WorkerState::Busy {
            state.state = WorkerState::Idle;
        }
        tracing::warn!(
            worker_id = %self.worker_id,
            latency_ms,
            tasks_processed = state.metrics.tasks_processed,
            tasks_failed = state.metrics.tasks_failed,
            avg_latency_ms = state.metrics.avg_latency_ms,
            "assignment abandoned at deadline"
        );
    }
}

fn check_payload(payload: &AnalysisPayload) -> Result<(), String> {
    match payload.risk_score {
        Some(score) => validate_unit_interval("risk_score", score).map_err(|e| e.to_string()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Notify;

    use super::*;
    use crate::task::TaskId;
    use riskgraph_core::EntityType;

    struct Fixed(f64);

    #[async_trait]
    impl Analyzer for Fixed {
        async fn analyze(
            &self,
            _: &Assignment,
            _: &CancellationToken,
        ) -> Result<AnalysisPayload, AnalyzerError> {
            Ok(AnalysisPayload::with_score(self.0))
        }
    }

    struct Failing;

    #[async_trait]
    impl Analyzer for Failing {
        async fn analyze(
            &self,
            _: &Assignment,
            _: &CancellationToken,
        ) -> Result<AnalysisPayload, AnalyzerError> {
            Err(AnalyzerError::Failed("upstream feed down".into()))
        }
    }

    /// Signals once started, then waits for cancellation.
    struct Blocking {
        started: Arc<Notify>,
        honour_cancel: bool,
    }

    #[async_trait]
    impl Analyzer for Blocking {
        async fn analyze(
            &self,
            _: &Assignment,
            cancel: &CancellationToken,
        ) -> Result<AnalysisPayload, AnalyzerError> {
            self.started.notify_one();
            if self.honour_cancel {
                cancel.cancelled().await;
                Err(AnalyzerError::Cancelled)
            } else {
                std::future::pending().await
            }
        }
    }

    fn assignment() -> Assignment {
        Assignment {
            task_id: TaskId::new(),
            entity_id: "acme".into(),
            entity_type: EntityType::Company,
            capability: Capability::new("credit"),
            parameters: serde_json::Value::Null,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn success_updates_metrics() {
        let worker = WorkerRuntime::new("credit-1", "credit", Fixed(0.4));
        let result = worker.submit(assignment(), CancellationToken::new()).await;
        assert!(result.is_success());
        assert_eq!(result.worker_id.as_deref(), Some("credit-1"));
        assert_eq!(result.payload.unwrap().risk_score, Some(0.4));
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.metrics().tasks_processed, 1);
        assert!(worker.metrics().last_task_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_enters_error_until_backoff_elapses() {
        let worker =
            WorkerRuntime::new("credit-1", "credit", Failing).with_backoff(Duration::from_secs(1));
        let result = worker.submit(assignment(), CancellationToken::new()).await;
        assert_eq!(result.outcome, WorkerOutcome::Error);
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerError));
        assert!(result.error_detail.unwrap().message.contains("upstream feed down"));
        assert_eq!(worker.state(), WorkerState::Error);
        assert_eq!(worker.metrics().tasks_failed, 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn out_of_range_score_is_invalid_payload() {
        let worker = WorkerRuntime::new("credit-1", "credit", Fixed(1.5));
        let result = worker.submit(assignment(), CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::InvalidPayload));
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn stopped_worker_rejects_until_restart() {
        let worker = WorkerRuntime::new("credit-1", "credit", Fixed(0.2));
        worker.stop();
        assert_eq!(worker.state(), WorkerState::Stopped);
        let result = worker.submit(assignment(), CancellationToken::new()).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerStopped));
        assert_eq!(worker.metrics().tasks_failed, 1);
        assert_eq!(worker.metrics().tasks_processed, 0);

        assert!(worker.restart());
        assert!(!worker.restart());
        let result = worker.submit(assignment(), CancellationToken::new()).await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn cancellation_interrupts_in_flight_analysis() {
        let started = Arc::new(Notify::new());
        let worker = Arc::new(WorkerRuntime::new(
            "credit-1",
            "credit",
            Blocking {
                started: started.clone(),
                honour_cancel: true,
            },
        ));
        let cancel = CancellationToken::new();
        let handle = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.submit(assignment(), cancel).await })
        };
        started.notified().await;
        assert_eq!(worker.state(), WorkerState::Busy);
        cancel.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.outcome, WorkerOutcome::TimedOut);
        assert!(result.cancelled);
        assert_eq!(worker.state(), WorkerState::Idle);
    }

    #[tokio::test]
    async fn stop_interrupts_unresponsive_analysis() {
        let started = Arc::new(Notify::new());
        let worker = Arc::new(WorkerRuntime::new(
            "credit-1",
            "credit",
            Blocking {
                started: started.clone(),
                honour_cancel: false,
            },
        ));
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.submit(assignment(), CancellationToken::new()).await })
        };
        started.notified().await;
        worker.stop();

        let result = handle.await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerStopped));
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn dropped_submission_returns_worker_to_idle() {
        let started = Arc::new(Notify::new());
        let worker = WorkerRuntime::new(
            "credit-1",
            "credit",
            Blocking {
                started: started.clone(),
                honour_cancel: false,
            },
        );
        let outcome = tokio::time::timeout(
            Duration::from_millis(20),
            worker.submit(assignment(), CancellationToken::new()),
        )
        .await;
        assert!(outcome.is_err());
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.metrics().tasks_failed, 1);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_slot_counts_once() {
        let started = Arc::new(Notify::new());
        let worker = Arc::new(WorkerRuntime::new(
            "credit-1",
            "credit",
            Blocking {
                started: started.clone(),
                honour_cancel: false,
            },
        ));
        let first = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.submit(assignment(), CancellationToken::new()).await })
        };
        started.notified().await;

        let cancel = CancellationToken::new();
        let second = {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.submit(assignment(), cancel).await })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        let result = second.await.unwrap();
        assert_eq!(result.outcome, WorkerOutcome::TimedOut);
        assert!(result.cancelled);
        assert_eq!(worker.metrics().tasks_failed, 1);
        assert_eq!(worker.state(), WorkerState::Busy);

        worker.stop();
        let result = first.await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::WorkerStopped));
        let metrics = worker.metrics();
        assert_eq!(metrics.tasks_failed, 2);
        assert_eq!(metrics.tasks_processed, 0);
        assert!(metrics.last_task_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_counts_once_and_keeps_error_state() {
        let worker =
            WorkerRuntime::new("credit-1", "credit", Failing).with_backoff(Duration::from_secs(1));
        worker.submit(assignment(), CancellationToken::new()).await;
        assert_eq!(worker.state(), WorkerState::Error);

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                cancel.cancel();
            })
        };
        let result = worker.submit(assignment(), cancel).await;
        canceller.await.unwrap();

        assert_eq!(result.outcome, WorkerOutcome::TimedOut);
        assert!(result.cancelled);
        let metrics = worker.metrics();
        assert_eq!(metrics.tasks_failed, 2);
        assert_eq!(metrics.tasks_processed, 0);
        assert_eq!(worker.state(), WorkerState::Error);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(worker.state(), WorkerState::Idle);
    }
}
