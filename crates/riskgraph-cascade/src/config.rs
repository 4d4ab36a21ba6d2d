//! Cascade configuration and the default-applying engine facade.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use riskgraph_core::{DependencyGraph, GraphSnapshot};

use crate::clustering::{clusters, ClusterMethod, ClusterParams, ClusterResult};
use crate::error::CascadeError;
use crate::hotspots::{hotspots, Hotspot, HotspotParams};
use crate::paths::{critical_paths, shortest_path, InfluencePath, PathSearch};
use crate::propagation::{propagate, CascadeResult, PropagationParams};
use crate::stats::{statistics, GraphStatistics};

/// Tunables for every cascade query. Decay, hotspot weighting and the
/// clustering seed live here rather than in code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub epsilon: f64,
    pub max_depth: usize,
    pub decay_rate: f64,
    pub risk_weight: f64,
    pub centrality_weight: f64,
    pub cluster_seed: u64,
    pub resolution: f64,
    pub min_cluster_size: usize,
    pub high_risk_threshold: f64,
    pub time_budget_ms: Option<u64>,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        CascadeConfig {
            epsilon: 0.01,
            max_depth: 3,
            decay_rate: 1.0,
            risk_weight: 0.5,
            centrality_weight: 0.5,
            cluster_seed: 42,
            resolution: 1.0,
            min_cluster_size: 1,
            high_risk_threshold: 0.7,
            time_budget_ms: None,
        }
    }
}

impl CascadeConfig {
    pub fn propagation(&self, shock: f64) -> PropagationParams {
        PropagationParams {
            shock,
            max_depth: self.max_depth,
            decay_rate: self.decay_rate,
            epsilon: self.epsilon,
            time_budget: self.time_budget_ms.map(Duration::from_millis),
        }
    }

    pub fn clustering(&self, method: ClusterMethod) -> ClusterParams {
        ClusterParams {
            method,
            seed: self.cluster_seed,
            resolution: self.resolution,
            min_cluster_size: self.min_cluster_size,
            high_risk_threshold: self.high_risk_threshold,
        }
    }

    pub fn hotspots(&self, top_n: usize) -> HotspotParams {
        HotspotParams {
            top_n,
            risk_weight: self.risk_weight,
            centrality_weight: self.centrality_weight,
        }
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        self.propagation(1.0).validate()?;
        self.clustering(ClusterMethod::Louvain).validate()?;
        self.hotspots(1).validate()
    }
}

/// Runs cascade queries with parameters taken from a [`CascadeConfig`].
#[derive(Debug, Clone, Default)]
pub struct CascadeEngine {
    config: CascadeConfig,
}

impl CascadeEngine {
    pub fn new(config: CascadeConfig) -> Result<Self, CascadeError> {
        config.validate()?;
        Ok(CascadeEngine { config })
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    pub fn propagate(
        &self,
        graph: &DependencyGraph,
        origin: &str,
        shock: f64,
    ) -> Result<CascadeResult, CascadeError> {
        propagate(graph, origin, &self.config.propagation(shock))
    }

    pub fn clusters(
        &self,
        graph: &DependencyGraph,
        method: ClusterMethod,
    ) -> Result<ClusterResult, CascadeError> {
        clusters(graph, &self.config.clustering(method))
    }

    /// Path search bounded by the configured `max_depth`.
    pub fn paths(
        &self,
        snapshot: &GraphSnapshot,
        source: &str,
        target: &str,
    ) -> Result<PathSearch, CascadeError> {
        PathSearch::new(snapshot.clone(), source, target, self.config.max_depth)
    }

    /// Strongest path to each entity reachable from `source` within the
    /// configured `max_depth`, at most `limit` of them.
    pub fn critical_paths(
        &self,
        graph: &DependencyGraph,
        source: &str,
        limit: usize,
    ) -> Result<Vec<InfluencePath>, CascadeError> {
        critical_paths(graph, source, self.config.max_depth, limit)
    }

    pub fn shortest_path(
        &self,
        graph: &DependencyGraph,
        source: &str,
        target: &str,
    ) -> Result<Option<InfluencePath>, CascadeError> {
        shortest_path(graph, source, target)
    }

    pub fn hotspots(&self, graph: &DependencyGraph, top_n: usize) -> Result<Vec<Hotspot>, CascadeError> {
        hotspots(graph, &self.config.hotspots(top_n))
    }

    pub fn statistics(&self, graph: &DependencyGraph) -> GraphStatistics {
        statistics(graph)
    }
}
