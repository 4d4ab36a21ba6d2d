//! Influence path search.
//!
//! [`PathSearch`] describes a query; nothing is computed until the first
//! call to [`PathSearch::iter`]. The full set of simple paths is then
//! materialized once, sorted, and cached, so every later `iter()` restarts
//! over the same finite sequence.
//!
//! [`critical_paths`] keeps the strongest path to every entity reachable
//! from a source, and [`shortest_path`] finds a route with the fewest hops.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use petgraph::algo::astar;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use riskgraph_core::{DependencyGraph, GraphSnapshot, Relationship, RelationshipType};

use crate::error::CascadeError;

/// One edge traversed by an [`InfluencePath`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub source_id: String,
    pub target_id: String,
    pub relationship_type: RelationshipType,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfluencePath {
    /// Entity ids from source to target.
    pub nodes: Vec<String>,
    pub hops: Vec<PathHop>,
    /// Number of hops.
    pub length: usize,
    /// Product of edge weights along the path.
    pub aggregated_risk: f64,
    /// Sum of edge weights along the path.
    pub total_weight: f64,
    /// Sum of `risk_score` over the entities on the path.
    pub total_node_risk: f64,
    /// Average `risk_score` of the entities on the path.
    pub mean_node_risk: f64,
}

impl InfluencePath {
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// The entity the path ends at.
    pub fn target(&self) -> Option<&str> {
        self.nodes.last().map(String::as_str)
    }
}

/// A lazy, restartable query for simple paths of at most `max_depth` hops.
///
/// Order: decreasing aggregated risk, then fewer hops, then node ids, then
/// relationship types. Parallel edges of different types produce distinct
/// paths.
#[derive(Debug)]
pub struct PathSearch {
    snapshot: GraphSnapshot,
    source: NodeIndex<u32>,
    target: NodeIndex<u32>,
    max_depth: usize,
    paths: OnceLock<Vec<InfluencePath>>,
}

impl PathSearch {
    pub fn new(
        snapshot: GraphSnapshot,
        source: &str,
        target: &str,
        max_depth: usize,
    ) -> Result<Self, CascadeError> {
        let source = lookup(&snapshot, source)?;
        let target = lookup(&snapshot, target)?;
        Ok(PathSearch {
            snapshot,
            source,
            target,
            max_depth,
            paths: OnceLock::new(),
        })
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Generation of the snapshot being searched.
    pub fn generation(&self) -> u64 {
        self.snapshot.generation()
    }

    /// Iterates from the strongest path. Computes the paths on first use.
    pub fn iter(&self) -> PathIter<'_> {
        let paths = self.paths.get_or_init(|| self.collect());
        PathIter {
            inner: paths.iter(),
        }
    }

    /// The strongest path, if any.
    pub fn best(&self) -> Option<&InfluencePath> {
        self.iter().next()
    }

    fn collect(&self) -> Vec<InfluencePath> {
        let graph: &DependencyGraph = &self.snapshot;
        let mut found = Vec::new();
        if self.source != self.target {
            walk_from(graph, self.source, self.max_depth, &mut |nodes, hops| {
                if nodes.last() == Some(&self.target) {
                    found.push(build_path(graph, nodes, hops));
                    false
                } else {
                    true
                }
            });
        }
        found.sort_by(compare_paths);
        tracing::debug!(paths = found.len(), max_depth = self.max_depth, "path search materialized");
        found
    }
}

impl<'a> IntoIterator for &'a PathSearch {
    type Item = &'a InfluencePath;
    type IntoIter = PathIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the cached paths of a [`PathSearch`].
#[derive(Debug, Clone)]
pub struct PathIter<'a> {
    inner: std::slice::Iter<'a, InfluencePath>,
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a InfluencePath;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for PathIter<'_> {}

/// The strongest path from `source` to each entity it reaches within
/// `max_depth` hops, ordered by decreasing aggregated risk then target id,
/// capped at `limit`.
pub fn critical_paths(
    graph: &DependencyGraph,
    source: &str,
    max_depth: usize,
    limit: usize,
) -> Result<Vec<InfluencePath>, CascadeError> {
    let start = lookup(graph, source)?;
    let mut best: BTreeMap<NodeIndex<u32>, InfluencePath> = BTreeMap::new();
    walk_from(graph, start, max_depth, &mut |nodes, hops| {
        if let Some(&last) = nodes.last() {
            let path = build_path(graph, nodes, hops);
            let stronger = best
                .get(&last)
                .map_or(true, |current| compare_paths(&path, current) == Ordering::Less);
            if stronger {
                best.insert(last, path);
            }
        }
        true
    });

    let mut paths: Vec<InfluencePath> = best.into_values().collect();
    paths.sort_by(|a, b| {
        b.aggregated_risk
            .total_cmp(&a.aggregated_risk)
            .then_with(|| a.target().cmp(&b.target()))
    });
    paths.truncate(limit);
    tracing::debug!(source, paths = paths.len(), max_depth, "critical paths ranked");
    Ok(paths)
}

/// A route from `source` to `target` with the fewest hops, or `None` when
/// the target is unreachable or equal to the source.
///
/// Between consecutive entities the heaviest edge is taken. When several
/// routes share the minimum hop count, one of them is returned.
pub fn shortest_path(
    graph: &DependencyGraph,
    source: &str,
    target: &str,
) -> Result<Option<InfluencePath>, CascadeError> {
    let start = lookup(graph, source)?;
    let goal = lookup(graph, target)?;
    if start == goal {
        return Ok(None);
    }

    let inner = graph.inner();
    let Some((_, route)) = astar(inner, start, |n| n == goal, |_| 1usize, |_| 0usize) else {
        return Ok(None);
    };

    let mut hops = Vec::with_capacity(route.len().saturating_sub(1));
    for pair in route.windows(2) {
        let strongest = inner
            .edges_directed(pair[0], Direction::Outgoing)
            .filter(|e| e.target() == pair[1])
            .max_by(|a, b| {
                a.weight()
                    .weight
                    .total_cmp(&b.weight().weight)
                    .then_with(|| b.weight().relationship_type.cmp(&a.weight().relationship_type))
            });
        let Some(edge) = strongest else {
            return Ok(None);
        };
        hops.push(hop(edge.weight()));
    }
    Ok(Some(build_path(graph, &route, &hops)))
}

fn lookup(graph: &DependencyGraph, id: &str) -> Result<NodeIndex<u32>, CascadeError> {
    graph
        .index_of(id)
        .ok_or_else(|| CascadeError::NodeNotFound { id: id.to_string() })
}

fn hop(rel: &Relationship) -> PathHop {
    PathHop {
        source_id: rel.source_id.clone(),
        target_id: rel.target_id.clone(),
        relationship_type: rel.relationship_type.clone(),
        weight: rel.weight,
    }
}

/// Depth-first enumeration of simple paths from `start`.
///
/// `visit` sees every path as it is extended and returns whether the walk
/// should continue past its last node.
fn walk_from<F>(graph: &DependencyGraph, start: NodeIndex<u32>, max_depth: usize, visit: &mut F)
where
    F: FnMut(&[NodeIndex<u32>], &[PathHop]) -> bool,
{
    if max_depth == 0 {
        return;
    }
    let mut nodes = vec![start];
    let mut hops = Vec::new();
    walk(graph, &mut nodes, &mut hops, max_depth, visit);
}

fn walk<F>(
    graph: &DependencyGraph,
    nodes: &mut Vec<NodeIndex<u32>>,
    hops: &mut Vec<PathHop>,
    max_depth: usize,
    visit: &mut F,
) where
    F: FnMut(&[NodeIndex<u32>], &[PathHop]) -> bool,
{
    let inner = graph.inner();
    let Some(&current) = nodes.last() else {
        return;
    };

    for edge in inner.edges_directed(current, Direction::Outgoing) {
        let next = edge.target();
        if nodes.contains(&next) {
            continue;
        }
        hops.push(hop(edge.weight()));
        nodes.push(next);

        if visit(nodes, hops) && hops.len() < max_depth {
            walk(graph, nodes, hops, max_depth, visit);
        }

        nodes.pop();
        hops.pop();
    }
}

fn build_path(graph: &DependencyGraph, nodes: &[NodeIndex<u32>], hops: &[PathHop]) -> InfluencePath {
    let inner = graph.inner();
    let aggregated_risk = hops.iter().map(|h| h.weight).product();
    let total_weight = hops.iter().map(|h| h.weight).sum();
    let total_node_risk: f64 = nodes.iter().map(|&n| inner[n].risk_score).sum();
    InfluencePath {
        nodes: nodes.iter().map(|&n| inner[n].id.clone()).collect(),
        hops: hops.to_vec(),
        length: hops.len(),
        aggregated_risk,
        total_weight,
        total_node_risk,
        mean_node_risk: total_node_risk / nodes.len() as f64,
    }
}

fn compare_paths(a: &InfluencePath, b: &InfluencePath) -> Ordering {
    b.aggregated_risk
        .total_cmp(&a.aggregated_risk)
        .then(a.hops.len().cmp(&b.hops.len()))
        .then_with(|| a.nodes.cmp(&b.nodes))
        .then_with(|| {
            let kinds = |p: &InfluencePath| {
                p.hops
                    .iter()
                    .map(|h| h.relationship_type.clone())
                    .collect::<Vec<_>>()
            };
            kinds(a).cmp(&kinds(b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskgraph_core::NodeUpsert;

    fn snapshot(edges: &[(&str, &str, f64)]) -> GraphSnapshot {
        let mut graph = DependencyGraph::new();
        for &(s, t, w) in edges {
            graph
                .upsert_edge(Relationship::new(s, t, RelationshipType::Exposure, w))
                .unwrap();
        }
        GraphSnapshot::new(graph)
    }

    #[test]
    fn chain_yields_single_path() {
        let snap = snapshot(&[("A", "B", 0.5), ("B", "C", 0.4)]);
        let search = PathSearch::new(snap, "A", "C", 2).unwrap();
        let paths: Vec<_> = search.iter().collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].nodes, vec!["A", "B", "C"]);
        assert!((paths[0].aggregated_risk - 0.2).abs() < 1e-9);
    }

    #[test]
    fn depth_limit_excludes_longer_paths() {
        let snap = snapshot(&[("A", "B", 0.5), ("B", "C", 0.4)]);
        let search = PathSearch::new(snap, "A", "C", 1).unwrap();
        assert_eq!(search.iter().count(), 0);
    }

    #[test]
    fn sorted_by_risk_and_restartable() {
        let snap = snapshot(&[
            ("A", "C", 0.3),
            ("A", "B", 0.9),
            ("B", "C", 0.9),
            ("A", "D", 0.2),
            ("D", "C", 0.2),
        ]);
        let search = PathSearch::new(snap, "A", "C", 3).unwrap();
        let risks: Vec<f64> = search.iter().map(|p| p.aggregated_risk).collect();
        assert_eq!(risks.len(), 3);
        assert!((risks[0] - 0.81).abs() < 1e-9);
        assert!((risks[1] - 0.3).abs() < 1e-9);
        assert!((risks[2] - 0.04).abs() < 1e-9);

        // Restart gives the same sequence.
        let again: Vec<f64> = search.iter().map(|p| p.aggregated_risk).collect();
        assert_eq!(risks, again);
        assert_eq!(search.best().unwrap().nodes, vec!["A", "B", "C"]);
    }

    #[test]
    fn cycles_do_not_repeat_nodes() {
        let snap = snapshot(&[("A", "B", 1.0), ("B", "A", 1.0), ("B", "C", 1.0)]);
        let search = PathSearch::new(snap, "A", "C", 10).unwrap();
        let paths: Vec<_> = search.iter().collect();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].len(), 2);
    }

    #[test]
    fn parallel_edge_types_are_distinct_paths() {
        let mut graph = DependencyGraph::new();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Exposure, 0.5))
            .unwrap();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Credit, 0.5))
            .unwrap();
        let search = PathSearch::new(GraphSnapshot::new(graph), "A", "B", 1).unwrap();
        let kinds: Vec<RelationshipType> = search
            .iter()
            .map(|p| p.hops[0].relationship_type.clone())
            .collect();
        // Equal risk and nodes; ordered by relationship type.
        assert_eq!(kinds, vec![RelationshipType::Exposure, RelationshipType::Credit]);
    }

    #[test]
    fn mean_node_risk_covers_endpoints() {
        let mut graph = DependencyGraph::new();
        graph.upsert_node(NodeUpsert::new("A").risk_score(0.6)).unwrap();
        graph.upsert_node(NodeUpsert::new("B").risk_score(0.2)).unwrap();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Exposure, 0.5))
            .unwrap();
        let search = PathSearch::new(GraphSnapshot::new(graph), "A", "B", 2).unwrap();
        assert!((search.best().unwrap().mean_node_risk - 0.4).abs() < 1e-9);
    }

    #[test]
    fn same_endpoints_and_missing_nodes() {
        let snap = snapshot(&[("A", "B", 0.5)]);
        let search = PathSearch::new(snap.clone(), "A", "A", 3).unwrap();
        assert!(search.best().is_none());
        assert!(matches!(
            PathSearch::new(snap, "A", "nowhere", 3),
            Err(CascadeError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn path_totals_follow_hops_and_nodes() {
        let mut graph = DependencyGraph::new();
        graph.upsert_node(NodeUpsert::new("A").risk_score(0.3)).unwrap();
        graph.upsert_node(NodeUpsert::new("B").risk_score(0.6)).unwrap();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Exposure, 0.5))
            .unwrap();
        graph
            .upsert_edge(Relationship::new("B", "C", RelationshipType::Exposure, 0.4))
            .unwrap();
        let search = PathSearch::new(GraphSnapshot::new(graph), "A", "C", 3).unwrap();
        let path = search.best().unwrap();
        assert_eq!(path.length, 2);
        assert!((path.total_weight - 0.9).abs() < 1e-9);
        assert!((path.total_node_risk - 0.9).abs() < 1e-9);
        assert!((path.mean_node_risk - 0.3).abs() < 1e-9);
    }

    #[test]
    fn critical_paths_keep_strongest_route_per_target() {
        let snap = snapshot(&[
            ("A", "B", 0.9),
            ("B", "C", 0.9),
            ("A", "C", 0.3),
            ("A", "D", 0.5),
            ("C", "E", 0.1),
        ]);
        let paths = critical_paths(&snap, "A", 3, 10).unwrap();
        let ranked: Vec<(&str, f64)> = paths
            .iter()
            .map(|p| (p.target().unwrap(), p.aggregated_risk))
            .collect();
        assert_eq!(ranked.len(), 4);
        assert_eq!(ranked[0].0, "B");
        assert_eq!(ranked[1].0, "C");
        assert!((ranked[1].1 - 0.81).abs() < 1e-9);
        assert_eq!(paths[1].nodes, vec!["A", "B", "C"]);
        assert_eq!(ranked[2].0, "D");
        assert_eq!(ranked[3].0, "E");
        assert!((ranked[3].1 - 0.081).abs() < 1e-9);

        let top = critical_paths(&snap, "A", 3, 2).unwrap();
        assert_eq!(top.len(), 2);
        assert!(critical_paths(&snap, "A", 0, 10).unwrap().is_empty());
        assert!(critical_paths(&snap, "E", 3, 10).unwrap().is_empty());
        assert!(matches!(
            critical_paths(&snap, "nowhere", 3, 10),
            Err(CascadeError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn critical_paths_break_ties_by_target_id() {
        let snap = snapshot(&[("A", "Z", 0.5), ("A", "M", 0.5), ("A", "B", 0.5)]);
        let targets: Vec<String> = critical_paths(&snap, "A", 2, 10)
            .unwrap()
            .iter()
            .filter_map(|p| p.target().map(str::to_string))
            .collect();
        assert_eq!(targets, vec!["B", "M", "Z"]);
    }

    #[test]
    fn shortest_path_minimizes_hops() {
        let snap = snapshot(&[
            ("A", "B", 0.9),
            ("B", "C", 0.9),
            ("C", "D", 0.9),
            ("A", "X", 0.1),
            ("X", "D", 0.1),
        ]);
        let path = shortest_path(&snap, "A", "D").unwrap().unwrap();
        assert_eq!(path.nodes, vec!["A", "X", "D"]);
        assert_eq!(path.length, 2);
        assert!((path.total_weight - 0.2).abs() < 1e-9);

        assert!(shortest_path(&snap, "D", "A").unwrap().is_none());
        assert!(shortest_path(&snap, "A", "A").unwrap().is_none());
        assert!(shortest_path(&snap, "A", "nowhere").is_err());
    }

    #[test]
    fn shortest_path_takes_heaviest_parallel_edge() {
        let mut graph = DependencyGraph::new();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Exposure, 0.2))
            .unwrap();
        graph
            .upsert_edge(Relationship::new("A", "B", RelationshipType::Credit, 0.7))
            .unwrap();
        let path = shortest_path(&graph, "A", "B").unwrap().unwrap();
        assert_eq!(path.hops[0].relationship_type, RelationshipType::Credit);
        assert!((path.aggregated_risk - 0.7).abs() < 1e-9);
    }
}
