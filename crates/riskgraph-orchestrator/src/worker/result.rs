//! Per-worker outcomes.
//!
//! A [`WorkerResult`] is always produced, whatever happens to the call:
//! success, analyzer error, missing capability, stopped worker, deadline or
//! cancellation. `error_detail` is present exactly when the outcome is
//! `Error`; the constructors are the only way this module builds results.

use serde::{Deserialize, Serialize};

use crate::capability::Capability;
use crate::task::unix_millis;
use crate::worker::AnalysisPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    Success,
    Error,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No worker is registered for the capability.
    CapabilityUnavailable,
    /// The analyzer returned an error.
    WorkerError,
    /// The chosen worker is stopped.
    WorkerStopped,
    /// The analyzer returned a payload that violates the contract.
    InvalidPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    /// `None` when no worker was ever assigned.
    pub worker_id: Option<String>,
    pub capability: Capability,
    pub outcome: WorkerOutcome,
    pub payload: Option<AnalysisPayload>,
    /// Unix milliseconds.
    pub started_at: u64,
    pub finished_at: u64,
    pub error_detail: Option<ErrorDetail>,
    /// `true` for a `TimedOut` produced by task cancellation rather than by
    /// the deadline.
    pub cancelled: bool,
    /// Dispatch attempts made for this capability.
    pub attempts: u32,
}

impl WorkerResult {
    pub fn success(
        worker_id: impl Into<String>,
        capability: Capability,
        payload: AnalysisPayload,
        started_at: u64,
    ) -> Self {
        WorkerResult {
            worker_id: Some(worker_id.into()),
            capability,
            outcome: WorkerOutcome::Success,
            payload: Some(payload),
            started_at,
            finished_at: unix_millis(),
            error_detail: None,
            cancelled: false,
            attempts: 1,
        }
    }

    pub fn error(
        worker_id: Option<String>,
        capability: Capability,
        kind: ErrorKind,
        message: impl Into<String>,
        started_at: u64,
    ) -> Self {
        WorkerResult {
            worker_id,
            capability,
            outcome: WorkerOutcome::Error,
            payload: None,
            started_at,
            finished_at: unix_millis(),
            error_detail: Some(ErrorDetail {
                kind,
                message: message.into(),
            }),
            cancelled: false,
            attempts: 1,
        }
    }

    pub fn timed_out(
        worker_id: Option<String>,
        capability: Capability,
        started_at: u64,
        cancelled: bool,
    ) -> Self {
        WorkerResult {
            worker_id,
            capability,
            outcome: WorkerOutcome::TimedOut,
            payload: None,
            started_at,
            finished_at: unix_millis(),
            error_detail: None,
            cancelled,
            attempts: 1,
        }
    }

    pub fn capability_unavailable(capability: Capability) -> Self {
        let message = format!("capability unavailable: no worker registered for '{capability}'");
        WorkerResult::error(
            None,
            capability,
            ErrorKind::CapabilityUnavailable,
            message,
            unix_millis(),
        )
    }

    pub fn is_success(&self) -> bool {
        self.outcome == WorkerOutcome::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error_detail.as_ref().map(|d| d.kind)
    }

    pub fn latency_ms(&self) -> u64 {
        self.finished_at.saturating_sub(self.started_at)
    }
}
