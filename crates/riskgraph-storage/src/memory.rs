//! In-memory implementation of [`GraphStore`].
//!
//! [`InMemoryStore`] keeps each graph as a live [`DependencyGraph`], so its
//! incremental operations share the exact semantics of the graph model.
//! Used by tests and anywhere persistence isn't needed.

use std::collections::BTreeMap;

use riskgraph_core::{
    CoreError, DependencyGraph, EdgeUpsertOutcome, GraphRecord, NodeUpsert, Relationship,
    UpsertKind,
};

use crate::error::StorageError;
use crate::hash::record_digest;
use crate::traits::GraphStore;
use crate::types::{unix_millis, GraphId, GraphSummary};

#[derive(Debug, Clone)]
struct StoredGraph {
    name: String,
    graph: DependencyGraph,
    updated_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    graphs: BTreeMap<GraphId, StoredGraph>,
    next_id: i64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stored(&self, id: GraphId) -> Result<&StoredGraph, StorageError> {
        self.graphs.get(&id).ok_or(StorageError::GraphNotFound(id.0))
    }

    fn stored_mut(&mut self, id: GraphId) -> Result<&mut StoredGraph, StorageError> {
        let stored = self
            .graphs
            .get_mut(&id)
            .ok_or(StorageError::GraphNotFound(id.0))?;
        stored.updated_at = unix_millis();
        Ok(stored)
    }
}

impl GraphStore for InMemoryStore {
    fn create_graph(&mut self, name: &str) -> Result<GraphId, StorageError> {
        if self.graphs.values().any(|g| g.name == name) {
            return Err(StorageError::DuplicateName(name.to_string()));
        }
        self.next_id += 1;
        let id = GraphId(self.next_id);
        self.graphs.insert(
            id,
            StoredGraph {
                name: name.to_string(),
                graph: DependencyGraph::new(),
                updated_at: unix_millis(),
            },
        );
        Ok(id)
    }

    fn find_graph(&self, name: &str) -> Result<Option<GraphId>, StorageError> {
        Ok(self
            .graphs
            .iter()
            .find(|(_, g)| g.name == name)
            .map(|(&id, _)| id))
    }

    fn save_graph(&mut self, id: GraphId, record: &GraphRecord) -> Result<(), StorageError> {
        self.stored(id)?;
        let graph = DependencyGraph::from_record(record.clone())?;
        self.stored_mut(id)?.graph = graph;
        Ok(())
    }

    fn load_graph(&self, id: GraphId) -> Result<GraphRecord, StorageError> {
        Ok(self.stored(id)?.graph.to_record())
    }

    fn delete_graph(&mut self, id: GraphId) -> Result<(), StorageError> {
        self.graphs
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::GraphNotFound(id.0))
    }

    fn list_graphs(&self) -> Result<Vec<GraphSummary>, StorageError> {
        Ok(self
            .graphs
            .iter()
            .map(|(&id, stored)| GraphSummary {
                id,
                name: stored.name.clone(),
                node_count: stored.graph.node_count(),
                edge_count: stored.graph.edge_count(),
                digest: record_digest(&stored.graph.to_record()).to_hex().to_string(),
                updated_at: stored.updated_at,
            })
            .collect())
    }

    fn upsert_entity(
        &mut self,
        id: GraphId,
        upsert: &NodeUpsert,
    ) -> Result<UpsertKind, StorageError> {
        upsert.validate()?;
        Ok(self.stored_mut(id)?.graph.upsert_node(upsert.clone())?)
    }

    fn upsert_relationship(
        &mut self,
        id: GraphId,
        relationship: &Relationship,
    ) -> Result<EdgeUpsertOutcome, StorageError> {
        relationship.validate()?;
        Ok(self
            .stored_mut(id)?
            .graph
            .upsert_edge(relationship.clone())?)
    }

    fn remove_entity(&mut self, id: GraphId, entity_id: &str) -> Result<(), StorageError> {
        let stored = self.stored(id)?;
        if !stored.graph.contains(entity_id) {
            return Err(CoreError::NodeNotFound {
                id: entity_id.to_string(),
            }
            .into());
        }
        self.stored_mut(id)?.graph.remove_node(entity_id)?;
        Ok(())
    }
}
