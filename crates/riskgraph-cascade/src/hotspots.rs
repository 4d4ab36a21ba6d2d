//! Hotspot ranking: risk score blended with weighted-degree centrality.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use riskgraph_core::DependencyGraph;

use crate::error::CascadeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotParams {
    pub top_n: usize,
    pub risk_weight: f64,
    pub centrality_weight: f64,
}

impl Default for HotspotParams {
    fn default() -> Self {
        HotspotParams {
            top_n: 10,
            risk_weight: 0.5,
            centrality_weight: 0.5,
        }
    }
}

impl HotspotParams {
    pub fn validate(&self) -> Result<(), CascadeError> {
        for (name, value) in [
            ("risk_weight", self.risk_weight),
            ("centrality_weight", self.centrality_weight),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(CascadeError::invalid(name, format!("{value} must be non-negative")));
            }
        }
        if self.risk_weight + self.centrality_weight <= 0.0 {
            return Err(CascadeError::invalid(
                "risk_weight",
                "risk_weight and centrality_weight cannot both be zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hotspot {
    pub node_id: String,
    pub risk_score: f64,
    /// Weighted degree (in + out) divided by the largest weighted degree.
    pub centrality: f64,
    /// Weighted mean of risk and centrality, in `[0, 1]`.
    pub composite: f64,
}

/// Top `top_n` entities by composite score, ties by ascending id.
pub fn hotspots(graph: &DependencyGraph, params: &HotspotParams) -> Result<Vec<Hotspot>, CascadeError> {
    params.validate()?;

    let mut degree: HashMap<&str, f64> = graph.nodes().map(|e| (e.id.as_str(), 0.0)).collect();
    for rel in graph.edges() {
        *degree.entry(rel.source_id.as_str()).or_insert(0.0) += rel.weight;
        *degree.entry(rel.target_id.as_str()).or_insert(0.0) += rel.weight;
    }
    let max_degree = degree.values().copied().fold(0.0, f64::max);
    let total_weight = params.risk_weight + params.centrality_weight;

    let mut ranked: Vec<Hotspot> = graph
        .nodes()
        .map(|entity| {
            let raw = degree.get(entity.id.as_str()).copied().unwrap_or(0.0);
            let centrality = if max_degree > 0.0 { raw / max_degree } else { 0.0 };
            let composite = (params.risk_weight * entity.risk_score
                + params.centrality_weight * centrality)
                / total_weight;
            Hotspot {
                node_id: entity.id.clone(),
                risk_score: entity.risk_score,
                centrality,
                composite,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.composite
            .total_cmp(&a.composite)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    ranked.truncate(params.top_n);
    Ok(ranked)
}
