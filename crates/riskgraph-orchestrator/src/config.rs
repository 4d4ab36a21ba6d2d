//! Orchestrator configuration.
//!
//! Defaults cover the reference deployment. A JSON file can override any
//! subset of fields, and `RISKGRAPH_*` environment variables override
//! individual values on top of the defaults:
//!
//! | variable | field |
//! |---|---|
//! | `RISKGRAPH_DEADLINE_MS` | `default_deadline_ms` |
//! | `RISKGRAPH_WORKER_TIMEOUT_MS` | `worker_timeout_ms` |
//! | `RISKGRAPH_MAX_RETRIES` | `max_retries` |
//! | `RISKGRAPH_RUN_CASCADE` | `run_cascade_on_completion` |
//! | `RISKGRAPH_HOTSPOT_COUNT` | `hotspot_count` |
//! | `RISKGRAPH_PATHS_PER_TARGET` | `paths_per_target` |
//! | `RISKGRAPH_CRITICAL_PATH_COUNT` | `critical_path_count` |
//! | `RISKGRAPH_MAX_CONCURRENT_WORKERS` | `pool.max_concurrent_workers` |
//! | `RISKGRAPH_ERROR_BACKOFF_MS` | `pool.error_backoff_ms` |
//! | `RISKGRAPH_CASCADE_EPSILON` | `cascade.epsilon` |
//! | `RISKGRAPH_CASCADE_MAX_DEPTH` | `cascade.max_depth` |
//! | `RISKGRAPH_CASCADE_DECAY` | `cascade.decay_rate` |
//! | `RISKGRAPH_CLUSTER_SEED` | `cascade.cluster_seed` |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use riskgraph_cascade::CascadeConfig;

use crate::error::OrchestratorError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of simultaneously busy workers across the pool.
    pub max_concurrent_workers: usize,
    /// How long a worker stays in `Error` before returning to `Idle`.
    pub error_backoff_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_concurrent_workers: 4,
            error_backoff_ms: 1_000,
        }
    }
}

impl PoolConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Overall task deadline when a request does not carry one.
    pub default_deadline_ms: u64,
    /// Optional cap on each worker call, applied below the task deadline.
    pub worker_timeout_ms: Option<u64>,
    /// Re-dispatches of a capability whose worker returned an error.
    pub max_retries: u32,
    /// Run propagation and hotspot queries after the graph update.
    pub run_cascade_on_completion: bool,
    /// Entities listed in a report's hotspot ranking.
    pub hotspot_count: usize,
    /// Paths kept per requested path target.
    pub paths_per_target: usize,
    /// Critical paths kept in a report; zero skips the query.
    pub critical_path_count: usize,
    pub pool: PoolConfig,
    pub cascade: CascadeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            default_deadline_ms: 30_000,
            worker_timeout_ms: None,
            max_retries: 0,
            run_cascade_on_completion: true,
            hotspot_count: 10,
            paths_per_target: 5,
            critical_path_count: 10,
            pool: PoolConfig::default(),
            cascade: CascadeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_ms.map(Duration::from_millis)
    }

    /// Reads a JSON file; missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, OrchestratorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: OrchestratorConfig = serde_json::from_str(&text).map_err(|e| {
            OrchestratorError::Config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with `RISKGRAPH_*` environment variables.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, OrchestratorError> {
        let mut config = OrchestratorConfig::default();

        if let Some(v) = parse_var(&lookup, "RISKGRAPH_DEADLINE_MS")? {
            config.default_deadline_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_WORKER_TIMEOUT_MS")? {
            config.worker_timeout_ms = Some(v);
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_RUN_CASCADE")? {
            config.run_cascade_on_completion = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_HOTSPOT_COUNT")? {
            config.hotspot_count = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_PATHS_PER_TARGET")? {
            config.paths_per_target = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_CRITICAL_PATH_COUNT")? {
            config.critical_path_count = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_MAX_CONCURRENT_WORKERS")? {
            config.pool.max_concurrent_workers = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_ERROR_BACKOFF_MS")? {
            config.pool.error_backoff_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_CASCADE_EPSILON")? {
            config.cascade.epsilon = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_CASCADE_MAX_DEPTH")? {
            config.cascade.max_depth = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_CASCADE_DECAY")? {
            config.cascade.decay_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "RISKGRAPH_CLUSTER_SEED")? {
            config.cascade.cluster_seed = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.default_deadline_ms == 0 {
            return Err(OrchestratorError::Config(
                "default_deadline_ms must be greater than zero".into(),
            ));
        }
        if self.worker_timeout_ms == Some(0) {
            return Err(OrchestratorError::Config(
                "worker_timeout_ms must be greater than zero when set".into(),
            ));
        }
        if self.pool.max_concurrent_workers == 0 {
            return Err(OrchestratorError::Config(
                "pool.max_concurrent_workers must be greater than zero".into(),
            ));
        }
        self.cascade
            .validate()
            .map_err(|e| OrchestratorError::Config(format!("cascade: {e}")))
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, OrchestratorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| OrchestratorError::Config(format!("{key}={raw:?}: {e}"))),
    }
}
