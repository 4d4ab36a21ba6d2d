//! Shock propagation.
//!
//! Starting from an origin with impact `shock`, influence flows along
//! outgoing edges level by level. The impact reaching a node at hop `h`
//! through an edge of weight `w` from a predecessor with impact `p` is
//! `p * w * decay^h`. Each node records the maximum impact over every
//! simple path (visited-per-path, so cycles terminate), along with the hop
//! count at which that maximum was first reached.
//!
//! Because weights and decay are both in `[0, 1]`, impact never grows along
//! a path. A state `(node, depth, impact)` that is dominated by an earlier
//! state for the same node (smaller or equal depth, greater or equal impact)
//! cannot improve any recorded maximum and is pruned.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

use riskgraph_core::DependencyGraph;

use crate::error::CascadeError;

/// Inputs to one propagation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationParams {
    pub shock: f64,
    pub max_depth: usize,
    pub decay_rate: f64,
    pub epsilon: f64,
    /// Wall-clock budget; the result is flagged `truncated` when exceeded.
    #[serde(default)]
    pub time_budget: Option<Duration>,
}

impl Default for PropagationParams {
    fn default() -> Self {
        PropagationParams {
            shock: 1.0,
            max_depth: 3,
            decay_rate: 1.0,
            epsilon: 0.01,
            time_budget: None,
        }
    }
}

impl PropagationParams {
    pub fn new(shock: f64) -> Self {
        PropagationParams {
            shock,
            ..Default::default()
        }
    }

    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn decay_rate(mut self, decay_rate: f64) -> Self {
        self.decay_rate = decay_rate;
        self
    }

    pub fn epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    pub fn validate(&self) -> Result<(), CascadeError> {
        if !(self.shock.is_finite() && (0.0..=1.0).contains(&self.shock)) {
            return Err(CascadeError::invalid("shock", format!("{} is outside [0, 1]", self.shock)));
        }
        if !(self.decay_rate.is_finite() && self.decay_rate > 0.0 && self.decay_rate <= 1.0) {
            return Err(CascadeError::invalid(
                "decay_rate",
                format!("{} is outside (0, 1]", self.decay_rate),
            ));
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0 && self.epsilon <= 1.0) {
            return Err(CascadeError::invalid(
                "epsilon",
                format!("{} is outside (0, 1]", self.epsilon),
            ));
        }
        Ok(())
    }
}

/// One affected entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeEntry {
    pub node_id: String,
    pub impact: f64,
    /// Hop count of the path that produced `impact`.
    pub depth: usize,
}

/// Per-depth summary of a cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSummary {
    pub depth: usize,
    pub count: usize,
    pub mean_impact: f64,
}

/// Output of [`propagate`]. Ordered by descending impact, ties by ascending
/// node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeResult {
    pub origin: String,
    pub shock: f64,
    /// Generation of the snapshot the query ran against.
    pub generation: u64,
    pub entries: Vec<CascadeEntry>,
    /// `true` if the time budget ran out before the traversal finished.
    pub truncated: bool,
}

impl CascadeResult {
    pub fn impact_of(&self, node_id: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.node_id == node_id)
            .map(|e| e.impact)
    }

    /// Entries other than the origin.
    pub fn affected(&self) -> impl Iterator<Item = &CascadeEntry> {
        self.entries.iter().filter(move |e| e.node_id != self.origin)
    }

    pub fn depth_breakdown(&self) -> Vec<DepthSummary> {
        let mut by_depth: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
        for entry in &self.entries {
            let slot = by_depth.entry(entry.depth).or_insert((0, 0.0));
            slot.0 += 1;
            slot.1 += entry.impact;
        }
        by_depth
            .into_iter()
            .map(|(depth, (count, total))| DepthSummary {
                depth,
                count,
                mean_impact: total / count as f64,
            })
            .collect()
    }
}

struct State {
    node: NodeIndex<u32>,
    impact: f64,
    path: Vec<NodeIndex<u32>>,
}

/// Runs a bounded-depth shock propagation from `origin`.
pub fn propagate(
    graph: &DependencyGraph,
    origin: &str,
    params: &PropagationParams,
) -> Result<CascadeResult, CascadeError> {
    params.validate()?;
    let start = graph
        .index_of(origin)
        .ok_or_else(|| CascadeError::NodeNotFound { id: origin.to_string() })?;

    let started = Instant::now();
    let inner = graph.inner();
    let mut truncated = false;

    // node -> (best impact, depth it was first reached at)
    let mut best: HashMap<NodeIndex<u32>, (f64, usize)> = HashMap::new();
    best.insert(start, (params.shock, 0));

    let mut frontier = vec![State {
        node: start,
        impact: params.shock,
        path: vec![start],
    }];

    'levels: for hop in 1..=params.max_depth {
        if frontier.is_empty() {
            break;
        }
        let factor = params.decay_rate.powi(hop as i32);
        let mut next = Vec::new();

        for state in &frontier {
            if let Some(budget) = params.time_budget {
                if started.elapsed() >= budget {
                    truncated = true;
                    break 'levels;
                }
            }
            for edge in inner.edges_directed(state.node, petgraph::Direction::Outgoing) {
                let target = edge.target();
                if state.path.contains(&target) {
                    continue;
                }
                let impact = state.impact * edge.weight().weight * factor;
                if impact < params.epsilon {
                    continue;
                }
                next.push(State {
                    node: target,
                    impact,
                    path: {
                        let mut path = state.path.clone();
                        path.push(target);
                        path
                    },
                });
            }
        }

        // Strongest states first so weaker duplicates are pruned.
        next.sort_by(|a, b| {
            b.impact
                .total_cmp(&a.impact)
                .then_with(|| inner[a.node].id.cmp(&inner[b.node].id))
        });

        frontier = Vec::with_capacity(next.len());
        for state in next {
            match best.entry(state.node) {
                Entry::Occupied(mut slot) => {
                    if slot.get().0 >= state.impact {
                        continue;
                    }
                    slot.insert((state.impact, hop));
                }
                Entry::Vacant(slot) => {
                    slot.insert((state.impact, hop));
                }
            }
            frontier.push(state);
        }
    }

    let mut entries: Vec<CascadeEntry> = best
        .into_iter()
        .map(|(node, (impact, depth))| CascadeEntry {
            node_id: inner[node].id.clone(),
            impact,
            depth,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.impact
            .total_cmp(&a.impact)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    if truncated {
        tracing::warn!(
            origin,
            recorded = entries.len(),
            "propagation exceeded its time budget; result truncated"
        );
    }

    Ok(CascadeResult {
        origin: origin.to_string(),
        shock: params.shock,
        generation: graph.generation(),
        entries,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use riskgraph_core::{Relationship, RelationshipType};

    fn graph(edges: &[(&str, &str, f64)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for &(s, t, w) in edges {
            graph
                .upsert_edge(Relationship::new(s, t, RelationshipType::Exposure, w))
                .unwrap();
        }
        graph
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn zero_depth_returns_only_origin() {
        let g = graph(&[("A", "B", 0.5)]);
        let result = propagate(&g, "A", &PropagationParams::new(1.0).max_depth(0)).unwrap();
        assert_eq!(
            result.entries,
            vec![CascadeEntry {
                node_id: "A".into(),
                impact: 1.0,
                depth: 0
            }]
        );
    }

    #[test]
    fn chain_multiplies_weights() {
        let g = graph(&[("A", "B", 0.5), ("B", "C", 0.4)]);
        let params = PropagationParams::new(1.0).max_depth(2).decay_rate(1.0);
        let result = propagate(&g, "A", &params).unwrap();

        let ids: Vec<&str> = result.entries.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert!(approx(result.impact_of("B").unwrap(), 0.5));
        assert!(approx(result.impact_of("C").unwrap(), 0.2));
        assert_eq!(result.entries[2].depth, 2);
        assert!(!result.truncated);
    }

    #[test]
    fn decay_applies_per_hop() {
        let g = graph(&[("A", "B", 0.5), ("B", "C", 0.4)]);
        let params = PropagationParams::new(1.0).max_depth(2).decay_rate(0.5);
        let result = propagate(&g, "A", &params).unwrap();
        // B: 1.0 * 0.5 * 0.5^1, C: 0.25 * 0.4 * 0.5^2
        assert!(approx(result.impact_of("B").unwrap(), 0.25));
        assert!(approx(result.impact_of("C").unwrap(), 0.025));
    }

    #[test]
    fn max_over_paths_wins_even_when_deeper() {
        // Direct A->C is weak, A->B->C is stronger.
        let g = graph(&[("A", "C", 0.1), ("A", "B", 0.9), ("B", "C", 0.9)]);
        let result = propagate(&g, "A", &PropagationParams::new(1.0)).unwrap();
        assert!(approx(result.impact_of("C").unwrap(), 0.81));
        let c = result.entries.iter().find(|e| e.node_id == "C").unwrap();
        assert_eq!(c.depth, 2);
    }

    #[test]
    fn epsilon_stops_weak_branches() {
        let g = graph(&[("A", "B", 0.1), ("B", "C", 0.05)]);
        let result = propagate(&g, "A", &PropagationParams::new(1.0).epsilon(0.01)).unwrap();
        assert!(result.impact_of("B").is_some());
        // 0.1 * 0.05 = 0.005 < epsilon
        assert!(result.impact_of("C").is_none());
    }

    #[test]
    fn cycles_terminate_and_origin_keeps_shock() {
        let g = graph(&[("A", "B", 1.0), ("B", "A", 1.0), ("B", "C", 1.0)]);
        let result = propagate(&g, "A", &PropagationParams::new(0.8).max_depth(10)).unwrap();
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.impact_of("A"), Some(0.8));
        // Equal impacts sort by id.
        let ids: Vec<&str> = result.entries.iter().map(|e| e.node_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
    }

    #[test]
    fn incoming_edges_carry_no_influence() {
        let g = graph(&[("B", "A", 0.9)]);
        let result = propagate(&g, "A", &PropagationParams::new(1.0)).unwrap();
        assert_eq!(result.entries.len(), 1);
    }

    #[test]
    fn depth_breakdown_groups_by_hop() {
        let g = graph(&[("A", "B", 0.5), ("A", "C", 0.3), ("B", "D", 0.5)]);
        let result = propagate(&g, "A", &PropagationParams::new(1.0)).unwrap();
        let breakdown = result.depth_breakdown();
        assert_eq!(breakdown.len(), 3);
        assert_eq!(breakdown[1].count, 2);
        assert!(approx(breakdown[1].mean_impact, 0.4));
        assert_eq!(result.affected().count(), 3);
    }

    #[test]
    fn rejects_bad_parameters_and_unknown_origin() {
        let g = graph(&[("A", "B", 0.5)]);
        assert!(matches!(
            propagate(&g, "A", &PropagationParams::new(1.5)),
            Err(CascadeError::InvalidParameter { .. })
        ));
        assert!(matches!(
            propagate(&g, "A", &PropagationParams::new(1.0).decay_rate(0.0)),
            Err(CascadeError::InvalidParameter { .. })
        ));
        assert!(matches!(
            propagate(&g, "Z", &PropagationParams::new(1.0)),
            Err(CascadeError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn zero_budget_truncates() {
        let g = graph(&[("A", "B", 0.5), ("B", "C", 0.5)]);
        let params = PropagationParams::new(1.0).time_budget(Duration::ZERO);
        let result = propagate(&g, "A", &params).unwrap();
        assert!(result.truncated);
        assert_eq!(result.impact_of("A"), Some(1.0));
    }

    proptest! {
        #[test]
        fn impacts_bounded_by_shock_and_sorted(
            edges in prop::collection::vec((0u8..8, 0u8..8, 0.0f64..=1.0), 1..30),
            shock in 0.0f64..=1.0,
            decay in 0.1f64..=1.0,
        ) {
            let mut g = DependencyGraph::new();
            for (s, t, w) in &edges {
                g.upsert_edge(Relationship::new(
                    format!("n{s}"), format!("n{t}"), RelationshipType::Exposure, *w,
                )).unwrap();
            }
            let origin = format!("n{}", edges[0].0);
            let params = PropagationParams::new(shock).decay_rate(decay).max_depth(4);
            let result = propagate(&g, &origin, &params).unwrap();

            prop_assert_eq!(result.impact_of(&origin), Some(shock));
            for pair in result.entries.windows(2) {
                prop_assert!(
                    pair[0].impact > pair[1].impact
                        || (pair[0].impact == pair[1].impact && pair[0].node_id < pair[1].node_id)
                );
            }
            for entry in result.affected() {
                prop_assert!(entry.impact <= shock);
                prop_assert!(entry.impact >= params.epsilon);
                prop_assert!(entry.depth >= 1 && entry.depth <= 4);
            }
        }
    }
}
