//! Cluster detection.
//!
//! Two partitioning methods:
//!
//! - [`ClusterMethod::Louvain`]: greedy modularity maximization with
//!   multi-level aggregation on the undirected, weight-summed view of the
//!   graph. Node visiting order is shuffled with a `ChaCha8Rng` seeded from
//!   [`ClusterParams::seed`], and every other source of ordering is either
//!   sorted ids or a `BTreeMap`, so a fixed seed on an unchanged snapshot
//!   always yields the same partition and modularity.
//! - [`ClusterMethod::ConnectedComponents`]: weakly connected components.
//!
//! Cluster labels are renumbered so label 0 holds the smallest entity id,
//! label 1 the smallest id not in cluster 0, and so on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use petgraph::graph::NodeIndex;
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use riskgraph_core::{DependencyGraph, EntityType};

use crate::error::CascadeError;

const MAX_PASSES: usize = 64;
const MAX_LEVELS: usize = 32;
const GAIN_TOLERANCE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMethod {
    Louvain,
    ConnectedComponents,
}

impl fmt::Display for ClusterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMethod::Louvain => f.write_str("louvain"),
            ClusterMethod::ConnectedComponents => f.write_str("connected_components"),
        }
    }
}

impl FromStr for ClusterMethod {
    type Err = CascadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "louvain" => Ok(ClusterMethod::Louvain),
            "connected_components" | "components" => Ok(ClusterMethod::ConnectedComponents),
            other => Err(CascadeError::invalid(
                "method",
                format!("unknown clustering method '{other}'"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterParams {
    pub method: ClusterMethod,
    pub seed: u64,
    /// Modularity resolution (gamma). Higher values favour smaller clusters.
    pub resolution: f64,
    /// Clusters smaller than this are left out of the summaries. The
    /// partition map always covers every node.
    pub min_cluster_size: usize,
    /// Mean risk above which a cluster is flagged `high_risk`.
    pub high_risk_threshold: f64,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            method: ClusterMethod::Louvain,
            seed: 42,
            resolution: 1.0,
            min_cluster_size: 1,
            high_risk_threshold: 0.7,
        }
    }
}

impl ClusterParams {
    pub fn validate(&self) -> Result<(), CascadeError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(CascadeError::invalid(
                "resolution",
                format!("{} must be a positive number", self.resolution),
            ));
        }
        if !(self.high_risk_threshold.is_finite()
            && (0.0..=1.0).contains(&self.high_risk_threshold))
        {
            return Err(CascadeError::invalid(
                "high_risk_threshold",
                format!("{} is outside [0, 1]", self.high_risk_threshold),
            ));
        }
        Ok(())
    }
}

/// Analysis of one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: usize,
    /// Member ids, sorted.
    pub members: Vec<String>,
    pub size: usize,
    pub mean_risk: f64,
    /// Directed edges inside the cluster over `size * (size - 1)`.
    pub density: f64,
    pub dominant_type: EntityType,
    pub high_risk: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResult {
    pub method: ClusterMethod,
    pub seed: u64,
    pub modularity: f64,
    /// Entity id to cluster label.
    pub partition: BTreeMap<String, usize>,
    /// Clusters of at least `min_cluster_size` members, by label.
    pub clusters: Vec<ClusterSummary>,
}

impl ClusterResult {
    pub fn cluster_count(&self) -> usize {
        self.partition.values().max().map_or(0, |&max| max + 1)
    }

    pub fn cluster_of(&self, node_id: &str) -> Option<usize> {
        self.partition.get(node_id).copied()
    }

    /// Clusters whose mean risk exceeds `threshold`, riskiest first.
    pub fn hotspots(&self, threshold: f64) -> Vec<&ClusterSummary> {
        let mut hot: Vec<&ClusterSummary> = self
            .clusters
            .iter()
            .filter(|c| c.mean_risk > threshold)
            .collect();
        hot.sort_by(|a, b| b.mean_risk.total_cmp(&a.mean_risk).then(a.id.cmp(&b.id)));
        hot
    }
}

/// Partitions the graph with the requested method.
pub fn clusters(graph: &DependencyGraph, params: &ClusterParams) -> Result<ClusterResult, CascadeError> {
    params.validate()?;
    let view = UndirectedView::build(graph);

    let raw = match params.method {
        ClusterMethod::Louvain => louvain(&view, params.seed, params.resolution),
        ClusterMethod::ConnectedComponents => weak_component_labels(graph, &view.order),
    };
    let labels = canonical_labels(&raw);
    let modularity = view.modularity(&labels, params.resolution);

    let partition: BTreeMap<String, usize> = view
        .order
        .iter()
        .zip(&labels)
        .map(|(&idx, &label)| (graph.inner()[idx].id.clone(), label))
        .collect();

    let clusters = summarize(graph, &view, &labels, params);
    tracing::debug!(
        method = %params.method,
        seed = params.seed,
        clusters = clusters.len(),
        modularity,
        "cluster detection finished"
    );

    Ok(ClusterResult {
        method: params.method,
        seed: params.seed,
        modularity,
        partition,
        clusters,
    })
}

/// Number of weakly connected components.
pub(crate) fn weak_component_count(graph: &DependencyGraph) -> usize {
    let order = graph.sorted_indices();
    let mut distinct = weak_component_labels(graph, &order);
    distinct.sort_unstable();
    distinct.dedup();
    distinct.len()
}

// ---------------------------------------------------------------------------
// Undirected weighted view
// ---------------------------------------------------------------------------

/// Symmetrized adjacency over node positions `0..n` (positions follow sorted
/// entity ids). Parallel and antiparallel edges are summed.
struct UndirectedView {
    order: Vec<NodeIndex<u32>>,
    adjacency: Vec<BTreeMap<usize, f64>>,
    self_loops: Vec<f64>,
    total_weight: f64,
}

impl UndirectedView {
    fn build(graph: &DependencyGraph) -> Self {
        let order = graph.sorted_indices();
        let position: HashMap<NodeIndex<u32>, usize> =
            order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();

        let n = order.len();
        let mut adjacency = vec![BTreeMap::new(); n];
        let mut self_loops = vec![0.0; n];
        let mut total_weight = 0.0;

        for &idx in &order {
            for edge in graph.inner().edges_directed(idx, petgraph::Direction::Outgoing) {
                let (u, v) = (position[&edge.source()], position[&edge.target()]);
                let w = edge.weight().weight;
                total_weight += w;
                if u == v {
                    self_loops[u] += w;
                } else {
                    *adjacency[u].entry(v).or_insert(0.0) += w;
                    *adjacency[v].entry(u).or_insert(0.0) += w;
                }
            }
        }

        UndirectedView {
            order,
            adjacency,
            self_loops,
            total_weight,
        }
    }

    /// Q = sum over clusters of `L_c / m - gamma * (d_c / 2m)^2`.
    fn modularity(&self, labels: &[usize], resolution: f64) -> f64 {
        let m = self.total_weight;
        if m <= 0.0 {
            return 0.0;
        }
        let clusters = labels.iter().max().map_or(0, |&max| max + 1);
        let mut internal = vec![0.0; clusters];
        let mut degree = vec![0.0; clusters];

        for (u, neighbors) in self.adjacency.iter().enumerate() {
            let c = labels[u];
            internal[c] += self.self_loops[u];
            degree[c] += 2.0 * self.self_loops[u];
            for (&v, &w) in neighbors {
                degree[c] += w;
                if labels[v] == c {
                    // Each undirected pair is visited from both ends.
                    internal[c] += w / 2.0;
                }
            }
        }

        internal
            .iter()
            .zip(&degree)
            .map(|(l, d)| l / m - resolution * (d / (2.0 * m)).powi(2))
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Louvain
// ---------------------------------------------------------------------------

struct Level {
    adjacency: Vec<BTreeMap<usize, f64>>,
    self_loops: Vec<f64>,
}

impl Level {
    fn degree(&self, node: usize) -> f64 {
        self.adjacency[node].values().sum::<f64>() + 2.0 * self.self_loops[node]
    }
}

/// Returns a community label per node position (not yet canonical).
fn louvain(view: &UndirectedView, seed: u64, resolution: f64) -> Vec<usize> {
    let n = view.order.len();
    let mut membership: Vec<usize> = (0..n).collect();
    if view.total_weight <= 0.0 {
        return membership;
    }

    let m2 = 2.0 * view.total_weight;
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut level = Level {
        adjacency: view.adjacency.clone(),
        self_loops: view.self_loops.clone(),
    };

    for _ in 0..MAX_LEVELS {
        let (communities, moved) = local_moves(&level, m2, resolution, &mut rng);
        if !moved {
            break;
        }
        let (renumbered, count) = compact(&communities);
        for label in membership.iter_mut() {
            *label = renumbered[*label];
        }
        if count == level.adjacency.len() {
            break;
        }
        level = aggregate(&level, &renumbered, count);
    }

    membership
}

/// One phase of greedy local moves. Returns the community per node and
/// whether any node changed community.
fn local_moves(level: &Level, m2: f64, resolution: f64, rng: &mut ChaCha8Rng) -> (Vec<usize>, bool) {
    let n = level.adjacency.len();
    let degrees: Vec<f64> = (0..n).map(|i| level.degree(i)).collect();
    let mut community: Vec<usize> = (0..n).collect();
    let mut totals = degrees.clone();

    let mut order: Vec<usize> = (0..n).collect();
    order.shuffle(rng);

    let mut moved_any = false;
    for _ in 0..MAX_PASSES {
        let mut moved = false;
        for &node in &order {
            let current = community[node];
            let k_i = degrees[node];

            let mut links: BTreeMap<usize, f64> = BTreeMap::new();
            for (&neighbor, &w) in &level.adjacency[node] {
                *links.entry(community[neighbor]).or_insert(0.0) += w;
            }

            totals[current] -= k_i;
            let gain = |c: usize, k_in: f64| k_in - resolution * totals[c] * k_i / m2;

            let mut best = current;
            let mut best_gain = gain(current, links.get(&current).copied().unwrap_or(0.0));
            for (&candidate, &k_in) in &links {
                let g = gain(candidate, k_in);
                if g > best_gain + GAIN_TOLERANCE {
                    best = candidate;
                    best_gain = g;
                }
            }

            totals[best] += k_i;
            if best != current {
                community[node] = best;
                moved = true;
            }
        }
        if !moved {
            break;
        }
        moved_any = true;
    }

    (community, moved_any)
}

/// Collapses each community into a single node.
fn aggregate(level: &Level, community: &[usize], count: usize) -> Level {
    let mut adjacency = vec![BTreeMap::new(); count];
    let mut self_loops = vec![0.0; count];

    for (u, neighbors) in level.adjacency.iter().enumerate() {
        let cu = community[u];
        self_loops[cu] += level.self_loops[u];
        for (&v, &w) in neighbors {
            let cv = community[v];
            if cu == cv {
                self_loops[cu] += w / 2.0;
            } else {
                *adjacency[cu].entry(cv).or_insert(0.0) += w;
            }
        }
    }

    Level {
        adjacency,
        self_loops,
    }
}

/// Renumbers labels to `0..count` in order of first appearance.
fn compact(labels: &[usize]) -> (Vec<usize>, usize) {
    let mut mapping: HashMap<usize, usize> = HashMap::new();
    let renumbered = labels
        .iter()
        .map(|label| {
            let next = mapping.len();
            *mapping.entry(*label).or_insert(next)
        })
        .collect();
    (renumbered, mapping.len())
}

// ---------------------------------------------------------------------------
// Connected components
// ---------------------------------------------------------------------------

fn weak_component_labels(graph: &DependencyGraph, order: &[NodeIndex<u32>]) -> Vec<usize> {
    let position: HashMap<NodeIndex<u32>, usize> =
        order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();
    let mut sets = UnionFind::<usize>::new(order.len());
    for &idx in order {
        for edge in graph.inner().edges_directed(idx, petgraph::Direction::Outgoing) {
            sets.union(position[&edge.source()], position[&edge.target()]);
        }
    }
    (0..order.len()).map(|pos| sets.find(pos)).collect()
}

// ---------------------------------------------------------------------------
// Labelling and analysis
// ---------------------------------------------------------------------------

/// Positions follow sorted ids, so first appearance is smallest member id.
fn canonical_labels(raw: &[usize]) -> Vec<usize> {
    compact(raw).0
}

fn summarize(
    graph: &DependencyGraph,
    view: &UndirectedView,
    labels: &[usize],
    params: &ClusterParams,
) -> Vec<ClusterSummary> {
    let inner = graph.inner();
    let mut members: BTreeMap<usize, Vec<NodeIndex<u32>>> = BTreeMap::new();
    let mut label_of: HashMap<NodeIndex<u32>, usize> = HashMap::new();
    for (&idx, &label) in view.order.iter().zip(labels) {
        members.entry(label).or_default().push(idx);
        label_of.insert(idx, label);
    }

    members
        .into_iter()
        .filter(|(_, nodes)| nodes.len() >= params.min_cluster_size)
        .map(|(id, nodes)| {
            let size = nodes.len();
            let mean_risk = nodes.iter().map(|&n| inner[n].risk_score).sum::<f64>() / size as f64;

            let internal_edges = nodes
                .iter()
                .flat_map(|&n| inner.edges_directed(n, petgraph::Direction::Outgoing))
                .filter(|e| e.source() != e.target() && label_of.get(&e.target()) == Some(&id))
                .count();
            let density = if size > 1 {
                internal_edges as f64 / (size * (size - 1)) as f64
            } else {
                0.0
            };

            let mut type_counts: BTreeMap<&EntityType, usize> = BTreeMap::new();
            for &n in &nodes {
                *type_counts.entry(&inner[n].entity_type).or_insert(0) += 1;
            }
            // Most frequent; BTreeMap order breaks ties.
            let dominant_type = type_counts
                .iter()
                .fold((None, 0), |(best, best_count), (&ty, &count)| {
                    if count > best_count {
                        (Some(ty), count)
                    } else {
                        (best, best_count)
                    }
                })
                .0
                .cloned()
                .unwrap_or(EntityType::Unknown);

            ClusterSummary {
                id,
                members: nodes.iter().map(|&n| inner[n].id.clone()).collect(),
                size,
                mean_risk,
                density,
                dominant_type,
                high_risk: mean_risk > params.high_risk_threshold,
            }
        })
        .collect()
}
