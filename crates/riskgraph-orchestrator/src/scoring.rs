//! The injected risk-scoring capability.
//!
//! After a task's results are merged, the orchestrator asks a [`RiskScorer`]
//! for the entity's fresh score. The scorer sees every score the workers
//! reported and may combine them however it likes; the core only checks
//! that the answer lies in `[0, 1]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use riskgraph_core::EntityType;

use crate::capability::Capability;
use crate::error::ScoringError;

/// What a scorer knows about the entity being scored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringContext {
    pub entity_type: EntityType,
    /// Score reported by each successful capability.
    pub reported: BTreeMap<Capability, f64>,
    /// Score currently stored in the graph, if the entity exists.
    pub previous: Option<f64>,
}

pub trait RiskScorer: Send + Sync {
    fn score(&self, entity_id: &str, context: &ScoringContext) -> Result<f64, ScoringError>;
}

impl<F> RiskScorer for F
where
    F: Fn(&str, &ScoringContext) -> Result<f64, ScoringError> + Send + Sync,
{
    fn score(&self, entity_id: &str, context: &ScoringContext) -> Result<f64, ScoringError> {
        self(entity_id, context)
    }
}

/// Default scorer: the highest reported score.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaxReportedScore;

impl RiskScorer for MaxReportedScore {
    fn score(&self, entity_id: &str, context: &ScoringContext) -> Result<f64, ScoringError> {
        context
            .reported
            .values()
            .copied()
            .reduce(f64::max)
            .ok_or_else(|| ScoringError::NoScore(entity_id.to_string()))
    }
}
