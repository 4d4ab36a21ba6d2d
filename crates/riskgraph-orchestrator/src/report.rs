//! What a finished task hands back to its caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use riskgraph_cascade::{CascadeResult, ClusterResult, Hotspot, InfluencePath};
use riskgraph_core::RelationshipType;

use crate::capability::Capability;
use crate::task::{AnalysisTask, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub task: AnalysisTask,
    /// Set when the task completed without every capability succeeding.
    pub degraded: bool,
    /// Score written to the graph for the analyzed entity.
    pub entity_score: Option<f64>,
    pub graph_delta: GraphDelta,
    pub cascade: Option<CascadeReport>,
}

impl AnalysisReport {
    pub fn status(&self) -> TaskStatus {
        self.task.status
    }
}

/// The graph changes one task made.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDelta {
    /// Graph generation after the update.
    pub generation: u64,
    pub nodes_upserted: Vec<String>,
    pub edges_upserted: Vec<EdgeRef>,
    pub stub_nodes_created: Vec<String>,
    /// Items that failed validation. Everything else was applied.
    pub rejected: Vec<RejectedUpdate>,
}

impl GraphDelta {
    pub fn is_empty(&self) -> bool {
        self.nodes_upserted.is_empty() && self.edges_upserted.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRef {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedUpdate {
    /// `None` for entity-level updates such as the merged score.
    pub capability: Option<Capability>,
    pub item: String,
    pub reason: String,
}

/// Cascade queries run against the graph right after the update.
///
/// A failing query is recorded in `errors`; the others still run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub generation: u64,
    pub propagation: Option<CascadeResult>,
    pub hotspots: Vec<Hotspot>,
    pub clusters: Option<ClusterResult>,
    /// Strongest paths from the analyzed entity, per requested target.
    pub paths: BTreeMap<String, Vec<InfluencePath>>,
    /// Strongest path to each entity the analyzed entity reaches.
    pub critical_paths: Vec<InfluencePath>,
    pub errors: Vec<String>,
}
