//! Whole-graph statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use riskgraph_core::DependencyGraph;

use crate::clustering::weak_component_count;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub generation: u64,
    pub node_count: usize,
    pub edge_count: usize,
    pub stub_count: usize,
    /// Entity count per type tag.
    pub node_types: BTreeMap<String, usize>,
    /// Relationship count per type tag.
    pub relationship_types: BTreeMap<String, usize>,
    /// `edges / (nodes * (nodes - 1))`, 0 for fewer than two nodes.
    pub density: f64,
    pub weakly_connected_components: usize,
    pub is_weakly_connected: bool,
    pub mean_risk: f64,
}

pub fn statistics(graph: &DependencyGraph) -> GraphStatistics {
    let mut node_types = BTreeMap::new();
    let mut total_risk = 0.0;
    for entity in graph.nodes() {
        *node_types.entry(entity.entity_type.to_string()).or_insert(0) += 1;
        total_risk += entity.risk_score;
    }
    let mut relationship_types = BTreeMap::new();
    for rel in graph.edges() {
        *relationship_types
            .entry(rel.relationship_type.to_string())
            .or_insert(0) += 1;
    }

    let nodes = graph.node_count();
    let density = if nodes > 1 {
        graph.edge_count() as f64 / (nodes * (nodes - 1)) as f64
    } else {
        0.0
    };
    let components = weak_component_count(graph);

    GraphStatistics {
        generation: graph.generation(),
        node_count: nodes,
        edge_count: graph.edge_count(),
        stub_count: graph.stub_count(),
        node_types,
        relationship_types,
        density,
        weakly_connected_components: components,
        is_weakly_connected: components == 1,
        mean_risk: if nodes > 0 { total_risk / nodes as f64 } else { 0.0 },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riskgraph_core::{EntityType, NodeUpsert, Relationship, RelationshipType};

    #[test]
    fn counts_types_and_components() {
        let mut g = DependencyGraph::new();
        g.upsert_node(NodeUpsert::new("a").entity_type(EntityType::Bank).risk_score(0.4))
            .unwrap();
        g.upsert_edge(Relationship::new("a", "b", RelationshipType::Credit, 0.5))
            .unwrap();
        g.upsert_edge(Relationship::new("c", "d", RelationshipType::Exposure, 0.5))
            .unwrap();

        let stats = statistics(&g);
        assert_eq!(stats.node_count, 4);
        assert_eq!(stats.edge_count, 2);
        assert_eq!(stats.stub_count, 3);
        assert_eq!(stats.node_types["bank"], 1);
        assert_eq!(stats.node_types["unknown"], 3);
        assert_eq!(stats.relationship_types["credit"], 1);
        assert_eq!(stats.weakly_connected_components, 2);
        assert!(!stats.is_weakly_connected);
        assert!((stats.density - 2.0 / 12.0).abs() < 1e-9);
        assert!((stats.mean_risk - 0.1).abs() < 1e-9);
    }

    #[test]
    fn empty_graph() {
        let stats = statistics(&DependencyGraph::new());
        assert_eq!(stats.node_count, 0);
        assert_eq!(stats.density, 0.0);
        assert_eq!(stats.weakly_connected_components, 0);
        assert!(!stats.is_weakly_connected);
    }
}
