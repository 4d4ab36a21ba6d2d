//! DependencyGraph: the weighted, directed entity graph.
//!
//! [`DependencyGraph`] stores entities and relationships in a petgraph
//! `StableGraph` (indices stay valid across removals) with two side indexes:
//! entity id to node index, and `(source, target, relationship type)` to edge
//! index. The edge index is what collapses repeated writes of the same
//! relationship type into one edge.
//!
//! # Auto-stub rule
//!
//! [`upsert_edge`](DependencyGraph::upsert_edge) never rejects an edge for
//! referencing an entity that does not exist yet. Missing endpoints are
//! created as stub entities (`type = unknown`, `risk_score = 0`,
//! `stub = true`) and reported back in [`EdgeUpsertOutcome::stubbed`]. A
//! later [`upsert_node`](DependencyGraph::upsert_node) for the same id
//! materializes the stub. As a result, every edge endpoint is always present
//! in the node set.
//!
//! # Atomicity
//!
//! Every mutation validates its whole input before touching the graph, so a
//! rejected call leaves the graph exactly as it was.

use std::collections::{HashMap, HashSet};

use petgraph::graph::{EdgeIndex, NodeIndex};
use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::Directed;
use serde::{Deserialize, Serialize};

use crate::entity::{validate_id, validate_unit_interval, Entity, NodeUpsert, Relationship};
use crate::error::CoreError;
use crate::kind::{EntityType, RelationshipType};
use crate::record::GraphRecord;

/// Underlying petgraph storage type.
pub type EntityGraph = StableGraph<Entity, Relationship, Directed, u32>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    source: NodeIndex<u32>,
    target: NodeIndex<u32>,
    kind: RelationshipType,
}

/// Whether an upsert created a new element or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertKind {
    Created,
    Updated,
}

/// Result of a successful edge upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeUpsertOutcome {
    pub kind: UpsertKind,
    /// Endpoint ids that were auto-created as stubs by this call.
    pub stubbed: Vec<String>,
}

/// Edge direction relative to a queried node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// One adjacent entity as seen from a queried node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub node_id: String,
    pub relationship_type: RelationshipType,
    pub weight: f64,
    /// `Outgoing` if the queried node is the edge source, else `Incoming`.
    pub direction: Direction,
}

/// Weighted directed graph of entities.
///
/// Not synchronized on its own; concurrent access goes through
/// [`SharedGraph`](crate::shared::SharedGraph), which publishes immutable
/// generations of this type.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: EntityGraph,
    ids: HashMap<String, NodeIndex<u32>>,
    edge_keys: HashMap<EdgeKey, EdgeIndex<u32>>,
    generation: u64,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from a persisted record.
    ///
    /// Every node and edge is validated; the first invalid element aborts the
    /// whole load. Edges may reference ids that are not listed as nodes, in
    /// which case the auto-stub rule applies. Duplicate node ids are rejected.
    pub fn from_record(record: GraphRecord) -> Result<Self, CoreError> {
        let mut graph = DependencyGraph::new();
        let mut seen = HashSet::new();

        for entity in record.nodes {
            validate_id("nodes.id", &entity.id)?;
            validate_unit_interval("nodes.risk_score", entity.risk_score)?;
            if !seen.insert(entity.id.clone()) {
                return Err(CoreError::validation(
                    "nodes.id",
                    format!("duplicate entity id '{}'", entity.id),
                ));
            }
            let id = entity.id.clone();
            let idx = graph.graph.add_node(entity);
            graph.ids.insert(id, idx);
        }

        for relationship in record.edges {
            graph.upsert_edge(relationship)?;
        }

        graph.generation = 0;
        Ok(graph)
    }

    /// Exports every entity and relationship, sorted by id for stable output.
    pub fn to_record(&self) -> GraphRecord {
        let mut nodes: Vec<Entity> = self.graph.node_weights().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut edges: Vec<Relationship> = self.graph.edge_weights().cloned().collect();
        edges.sort_by(|a, b| {
            (&a.source_id, &a.target_id, &a.relationship_type).cmp(&(
                &b.source_id,
                &b.target_id,
                &b.relationship_type,
            ))
        });

        GraphRecord { nodes, edges }
    }

    // -----------------------------------------------------------------------
    // Read-only accessors
    // -----------------------------------------------------------------------

    /// Returns a read-only reference to the petgraph storage.
    pub fn inner(&self) -> &EntityGraph {
        &self.graph
    }

    /// Monotonic mutation counter. Bumped by every successful mutation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Number of auto-created entities not yet materialized.
    pub fn stub_count(&self) -> usize {
        self.graph.node_weights().filter(|e| e.stub).count()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains_key(id)
    }

    pub fn get_node(&self, id: &str) -> Option<&Entity> {
        self.ids.get(id).and_then(|&idx| self.graph.node_weight(idx))
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex<u32>> {
        self.ids.get(id).copied()
    }

    pub fn entity(&self, idx: NodeIndex<u32>) -> Option<&Entity> {
        self.graph.node_weight(idx)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Entity> {
        self.graph.node_weights()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Relationship> {
        self.graph.edge_weights()
    }

    /// Node indices ordered by entity id. Algorithms that must be
    /// deterministic iterate in this order instead of index order.
    pub fn sorted_indices(&self) -> Vec<NodeIndex<u32>> {
        let mut indices: Vec<NodeIndex<u32>> = self.graph.node_indices().collect();
        indices.sort_by(|&a, &b| self.graph[a].id.cmp(&self.graph[b].id));
        indices
    }

    pub fn get_edge(
        &self,
        source_id: &str,
        target_id: &str,
        kind: &RelationshipType,
    ) -> Option<&Relationship> {
        let key = self.edge_key(source_id, target_id, kind)?;
        self.edge_keys
            .get(&key)
            .and_then(|&idx| self.graph.edge_weight(idx))
    }

    /// Lists adjacent entities, optionally restricted to some relationship
    /// types. Results are sorted by neighbor id, then relationship type.
    pub fn neighbors(
        &self,
        id: &str,
        direction: Direction,
        edge_type_filter: Option<&[RelationshipType]>,
    ) -> Result<Vec<Neighbor>, CoreError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| CoreError::NodeNotFound { id: id.to_string() })?;

        let wanted = |kind: &RelationshipType| {
            edge_type_filter.map_or(true, |filter| filter.contains(kind))
        };

        let mut out = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            for edge in self.graph.edges_directed(idx, petgraph::Direction::Outgoing) {
                let rel = edge.weight();
                if wanted(&rel.relationship_type) {
                    out.push(Neighbor {
                        node_id: rel.target_id.clone(),
                        relationship_type: rel.relationship_type.clone(),
                        weight: rel.weight,
                        direction: Direction::Outgoing,
                    });
                }
            }
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            for edge in self.graph.edges_directed(idx, petgraph::Direction::Incoming) {
                let rel = edge.weight();
                if wanted(&rel.relationship_type) {
                    out.push(Neighbor {
                        node_id: rel.source_id.clone(),
                        relationship_type: rel.relationship_type.clone(),
                        weight: rel.weight,
                        direction: Direction::Incoming,
                    });
                }
            }
        }

        out.sort_by(|a, b| {
            (&a.node_id, &a.relationship_type).cmp(&(&b.node_id, &b.relationship_type))
        });
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Mutation
    // -----------------------------------------------------------------------

    /// Creates or updates an entity.
    ///
    /// Validation happens first; on error nothing changes. Updating a stub
    /// materializes it.
    pub fn upsert_node(&mut self, upsert: NodeUpsert) -> Result<UpsertKind, CoreError> {
        upsert.validate()?;

        let kind = match self.ids.get(&upsert.id) {
            Some(&idx) => {
                let entity = self
                    .graph
                    .node_weight_mut(idx)
                    .ok_or_else(|| CoreError::GraphConsistency {
                        reason: format!("id index points at missing node '{}'", upsert.id),
                    })?;
                if let Some(entity_type) = upsert.entity_type {
                    entity.entity_type = entity_type;
                }
                if let Some(score) = upsert.risk_score {
                    entity.risk_score = score;
                }
                entity.attributes.extend(upsert.attributes);
                entity.stub = false;
                UpsertKind::Updated
            }
            None => {
                let entity = Entity {
                    id: upsert.id.clone(),
                    entity_type: upsert.entity_type.unwrap_or(EntityType::Unknown),
                    risk_score: upsert.risk_score.unwrap_or(0.0),
                    attributes: upsert.attributes,
                    stub: false,
                };
                let idx = self.graph.add_node(entity);
                self.ids.insert(upsert.id, idx);
                UpsertKind::Created
            }
        };

        self.generation += 1;
        Ok(kind)
    }

    /// Creates or updates a relationship, auto-stubbing missing endpoints.
    ///
    /// A second write with the same `(source, target, type)` replaces the
    /// weight and merges attributes.
    pub fn upsert_edge(
        &mut self,
        relationship: Relationship,
    ) -> Result<EdgeUpsertOutcome, CoreError> {
        relationship.validate()?;

        let mut stubbed = Vec::new();
        let source = self.ensure_node(&relationship.source_id, &mut stubbed);
        let target = self.ensure_node(&relationship.target_id, &mut stubbed);
        let key = EdgeKey {
            source,
            target,
            kind: relationship.relationship_type.clone(),
        };

        let kind = match self.edge_keys.get(&key) {
            Some(&idx) => {
                let existing = self.graph.edge_weight_mut(idx).ok_or_else(|| {
                    CoreError::GraphConsistency {
                        reason: format!(
                            "edge index points at missing edge '{}' -> '{}'",
                            relationship.source_id, relationship.target_id
                        ),
                    }
                })?;
                existing.weight = relationship.weight;
                existing.attributes.extend(relationship.attributes);
                UpsertKind::Updated
            }
            None => {
                let idx = self.graph.add_edge(source, target, relationship);
                self.edge_keys.insert(key, idx);
                UpsertKind::Created
            }
        };

        if !stubbed.is_empty() {
            tracing::debug!(stubbed = ?stubbed, "auto-created stub entities for edge endpoints");
        }

        self.generation += 1;
        Ok(EdgeUpsertOutcome { kind, stubbed })
    }

    /// Explicitly removes an entity and every incident relationship.
    pub fn remove_node(&mut self, id: &str) -> Result<Entity, CoreError> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| CoreError::NodeNotFound { id: id.to_string() })?;

        let incident: Vec<EdgeKey> = self
            .graph
            .edges_directed(idx, petgraph::Direction::Outgoing)
            .chain(self.graph.edges_directed(idx, petgraph::Direction::Incoming))
            .map(|edge| EdgeKey {
                source: edge.source(),
                target: edge.target(),
                kind: edge.weight().relationship_type.clone(),
            })
            .collect();
        for key in incident {
            self.edge_keys.remove(&key);
        }

        let entity = self
            .graph
            .remove_node(idx)
            .ok_or_else(|| CoreError::GraphConsistency {
                reason: format!("id index points at missing node '{id}'"),
            })?;
        self.ids.remove(id);
        self.generation += 1;
        Ok(entity)
    }

    /// Removes one relationship. Endpoints stay in place.
    pub fn remove_edge(
        &mut self,
        source_id: &str,
        target_id: &str,
        kind: &RelationshipType,
    ) -> Result<Relationship, CoreError> {
        let not_found = || CoreError::EdgeNotFound {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            kind: kind.clone(),
        };
        let key = self
            .edge_key(source_id, target_id, kind)
            .ok_or_else(not_found)?;
        let idx = self.edge_keys.remove(&key).ok_or_else(not_found)?;
        let removed = self.graph.remove_edge(idx).ok_or_else(not_found)?;
        self.generation += 1;
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn edge_key(&self, source_id: &str, target_id: &str, kind: &RelationshipType) -> Option<EdgeKey> {
        Some(EdgeKey {
            source: self.index_of(source_id)?,
            target: self.index_of(target_id)?,
            kind: kind.clone(),
        })
    }

    fn ensure_node(&mut self, id: &str, stubbed: &mut Vec<String>) -> NodeIndex<u32> {
        if let Some(&idx) = self.ids.get(id) {
            return idx;
        }
        let idx = self.graph.add_node(Entity::stub(id));
        self.ids.insert(id.to_string(), idx);
        stubbed.push(id.to_string());
        idx
    }

    /// Verifies both side indexes agree with the petgraph storage.
    #[cfg(test)]
    pub(crate) fn assert_consistency(&self) {
        assert_eq!(self.ids.len(), self.graph.node_count());
        assert_eq!(self.edge_keys.len(), self.graph.edge_count());
        for (id, &idx) in &self.ids {
            assert_eq!(&self.graph[idx].id, id);
        }
        for idx in self.graph.edge_indices() {
            let (source, target) = self.graph.edge_endpoints(idx).unwrap();
            let rel = &self.graph[idx];
            assert_eq!(self.graph[source].id, rel.source_id);
            assert_eq!(self.graph[target].id, rel.target_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn company(id: &str, score: f64) -> NodeUpsert {
        NodeUpsert::new(id)
            .entity_type(EntityType::Company)
            .risk_score(score)
    }

    fn exposure(source: &str, target: &str, weight: f64) -> Relationship {
        Relationship::new(source, target, RelationshipType::Exposure, weight)
    }

    #[test]
    fn upsert_node_creates_then_updates() {
        let mut graph = DependencyGraph::new();
        assert_eq!(graph.upsert_node(company("acme", 0.2)).unwrap(), UpsertKind::Created);
        assert_eq!(
            graph
                .upsert_node(NodeUpsert::new("acme").attribute("rating", "BB".into()))
                .unwrap(),
            UpsertKind::Updated
        );

        let acme = graph.get_node("acme").unwrap();
        // Score untouched by an upsert without one.
        assert_eq!(acme.risk_score, 0.2);
        assert_eq!(acme.entity_type, EntityType::Company);
        assert_eq!(acme.attributes["rating"], "BB");
        assert_eq!(graph.generation(), 2);
    }

    #[test]
    fn upsert_edge_auto_stubs_missing_endpoints() {
        let mut graph = DependencyGraph::new();
        graph.upsert_node(company("a", 0.1)).unwrap();

        let outcome = graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        assert_eq!(outcome.kind, UpsertKind::Created);
        assert_eq!(outcome.stubbed, vec!["b".to_string()]);

        let b = graph.get_node("b").unwrap();
        assert!(b.stub);
        assert_eq!(b.entity_type, EntityType::Unknown);
        assert_eq!(b.risk_score, 0.0);
        assert_eq!(graph.stub_count(), 1);

        graph.upsert_node(company("b", 0.3)).unwrap();
        assert!(!graph.get_node("b").unwrap().stub);
        assert_eq!(graph.stub_count(), 0);
        graph.assert_consistency();
    }

    #[test]
    fn same_type_edges_collapse_latest_weight_wins() {
        let mut graph = DependencyGraph::new();
        graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        let outcome = graph.upsert_edge(exposure("a", "b", 0.8)).unwrap();
        assert_eq!(outcome.kind, UpsertKind::Updated);
        assert!(outcome.stubbed.is_empty());
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(
            graph
                .get_edge("a", "b", &RelationshipType::Exposure)
                .unwrap()
                .weight,
            0.8
        );
    }

    #[test]
    fn different_type_edges_are_distinct() {
        let mut graph = DependencyGraph::new();
        graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        graph
            .upsert_edge(Relationship::new("a", "b", RelationshipType::Ownership, 0.3))
            .unwrap();
        assert_eq!(graph.edge_count(), 2);

        let out = graph.neighbors("a", Direction::Outgoing, None).unwrap();
        assert_eq!(out.len(), 2);
        let owned = graph
            .neighbors("a", Direction::Outgoing, Some(&[RelationshipType::Ownership]))
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].weight, 0.3);
    }

    #[test]
    fn neighbors_by_direction() {
        let mut graph = DependencyGraph::new();
        graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        graph.upsert_edge(exposure("c", "a", 0.4)).unwrap();

        let outgoing = graph.neighbors("a", Direction::Outgoing, None).unwrap();
        assert_eq!(outgoing.len(), 1);
        assert_eq!(outgoing[0].node_id, "b");

        let incoming = graph.neighbors("a", Direction::Incoming, None).unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].node_id, "c");
        assert_eq!(incoming[0].direction, Direction::Incoming);

        let both = graph.neighbors("a", Direction::Both, None).unwrap();
        assert_eq!(
            both.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );

        assert!(matches!(
            graph.neighbors("zzz", Direction::Both, None),
            Err(CoreError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn rejected_inputs_leave_graph_unchanged() {
        let mut graph = DependencyGraph::new();
        graph.upsert_node(company("a", 0.1)).unwrap();
        let before = graph.to_record();
        let generation = graph.generation();

        assert!(graph.upsert_node(company("a", 1.2)).unwrap_err().is_validation());
        assert!(graph.upsert_node(company("new", -0.5)).unwrap_err().is_validation());
        // Missing target must not be stubbed when the weight is invalid.
        assert!(graph
            .upsert_edge(exposure("a", "ghost", 7.0))
            .unwrap_err()
            .is_validation());

        assert_eq!(graph.to_record(), before);
        assert_eq!(graph.generation(), generation);
        assert!(!graph.contains("ghost"));
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut graph = DependencyGraph::new();
        graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        graph.upsert_edge(exposure("b", "c", 0.4)).unwrap();
        graph.upsert_edge(exposure("c", "a", 0.3)).unwrap();

        let removed = graph.remove_node("b").unwrap();
        assert_eq!(removed.id, "b");
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 1);
        graph.assert_consistency();

        // Re-adding the pair must not resurrect a stale key.
        graph.upsert_edge(exposure("a", "b", 0.9)).unwrap();
        assert_eq!(graph.edge_count(), 2);
        graph.assert_consistency();
    }

    #[test]
    fn remove_edge_keeps_endpoints() {
        let mut graph = DependencyGraph::new();
        graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
        let removed = graph
            .remove_edge("a", "b", &RelationshipType::Exposure)
            .unwrap();
        assert_eq!(removed.weight, 0.5);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 2);
        assert!(matches!(
            graph.remove_edge("a", "b", &RelationshipType::Exposure),
            Err(CoreError::EdgeNotFound { .. })
        ));
    }

    #[test]
    fn record_roundtrip_preserves_stubs_and_attributes() {
        let mut graph = DependencyGraph::new();
        graph
            .upsert_node(company("a", 0.4).attribute("country", "FR".into()))
            .unwrap();
        graph
            .upsert_edge(exposure("a", "b", 0.5).with_attribute("notional", 10.into()))
            .unwrap();

        let record = graph.to_record();
        let json = serde_json::to_string(&record).unwrap();
        let back = DependencyGraph::from_record(serde_json::from_str(&json).unwrap()).unwrap();

        assert_eq!(back.to_record(), record);
        assert!(back.get_node("b").unwrap().stub);
        back.assert_consistency();
    }

    #[test]
    fn from_record_rejects_duplicates_and_bad_scores() {
        let dup = GraphRecord {
            nodes: vec![Entity::stub("a"), Entity::stub("a")],
            edges: vec![],
        };
        assert!(DependencyGraph::from_record(dup).unwrap_err().is_validation());

        let mut bad = Entity::stub("a");
        bad.risk_score = 3.0;
        let record = GraphRecord {
            nodes: vec![bad],
            edges: vec![],
        };
        assert!(DependencyGraph::from_record(record).unwrap_err().is_validation());
    }

    proptest! {
        #[test]
        fn every_edge_endpoint_exists(
            edges in prop::collection::vec((0u8..12, 0u8..12, 0u8..3, 0.0f64..=1.0), 0..60)
        ) {
            let kinds = [
                RelationshipType::Exposure,
                RelationshipType::Ownership,
                RelationshipType::Correlation,
            ];
            let mut graph = DependencyGraph::new();
            for (s, t, k, w) in edges {
                let rel = Relationship::new(
                    format!("n{s}"),
                    format!("n{t}"),
                    kinds[k as usize].clone(),
                    w,
                );
                graph.upsert_edge(rel).unwrap();
            }
            for rel in graph.edges() {
                prop_assert!(graph.contains(&rel.source_id));
                prop_assert!(graph.contains(&rel.target_id));
            }
            graph.assert_consistency();
        }

        #[test]
        fn out_of_range_weights_are_rejected_atomically(
            weight in prop_oneof![-10.0f64..-0.0001, 1.0001f64..10.0],
        ) {
            let mut graph = DependencyGraph::new();
            graph.upsert_edge(exposure("a", "b", 0.5)).unwrap();
            let before = graph.to_record();

            let err = graph.upsert_edge(exposure("a", "c", weight)).unwrap_err();
            prop_assert!(err.is_validation());
            let err = graph.upsert_node(company("a", weight)).unwrap_err();
            prop_assert!(err.is_validation());
            prop_assert_eq!(graph.to_record(), before);
        }
    }
}
