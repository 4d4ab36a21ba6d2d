//! The [`GraphStore`] trait: the persistence hook for dependency graphs.
//!
//! Two-layer API:
//! - **Bulk** methods (`save_graph`, `load_graph`) snapshot and hydrate a
//!   whole graph as a [`GraphRecord`].
//! - **Incremental** methods (`upsert_entity`, `upsert_relationship`,
//!   `remove_entity`) write one element with the same semantics as
//!   [`DependencyGraph`]: validation before mutation, auto-stubbed edge
//!   endpoints, same-type edges collapsing with latest write winning.
//!
//! Backends are swappable without changing core logic.

use riskgraph_core::{
    DependencyGraph, EdgeUpsertOutcome, GraphRecord, NodeUpsert, Relationship, UpsertKind,
};

use crate::error::StorageError;
use crate::hash::record_digest;
use crate::types::{GraphId, GraphSummary};

/// The storage contract for dependency graphs. Synchronous; callers that
/// share a store across tasks wrap it in a mutex.
pub trait GraphStore {
    /// Creates a new empty graph. Names are unique.
    fn create_graph(&mut self, name: &str) -> Result<GraphId, StorageError>;

    /// Looks a graph up by name.
    fn find_graph(&self, name: &str) -> Result<Option<GraphId>, StorageError>;

    /// Replaces the stored contents of `id` with `record`.
    ///
    /// The record is validated as a whole first (see
    /// [`DependencyGraph::from_record`]); an invalid record changes nothing.
    fn save_graph(&mut self, id: GraphId, record: &GraphRecord) -> Result<(), StorageError>;

    /// Loads every entity and relationship of `id`, sorted by id.
    fn load_graph(&self, id: GraphId) -> Result<GraphRecord, StorageError>;

    fn delete_graph(&mut self, id: GraphId) -> Result<(), StorageError>;

    fn list_graphs(&self) -> Result<Vec<GraphSummary>, StorageError>;

    fn upsert_entity(
        &mut self,
        id: GraphId,
        upsert: &NodeUpsert,
    ) -> Result<UpsertKind, StorageError>;

    /// Writes one relationship, creating stub rows for missing endpoints.
    fn upsert_relationship(
        &mut self,
        id: GraphId,
        relationship: &Relationship,
    ) -> Result<EdgeUpsertOutcome, StorageError>;

    /// Removes an entity and its incident relationships.
    fn remove_entity(&mut self, id: GraphId, entity_id: &str) -> Result<(), StorageError>;

    // -------------------------------------------------------------------
    // Provided conveniences
    // -------------------------------------------------------------------

    fn load_dependency_graph(&self, id: GraphId) -> Result<DependencyGraph, StorageError> {
        Ok(DependencyGraph::from_record(self.load_graph(id)?)?)
    }

    fn save_dependency_graph(
        &mut self,
        id: GraphId,
        graph: &DependencyGraph,
    ) -> Result<(), StorageError> {
        self.save_graph(id, &graph.to_record())
    }

    /// Returns the id for `name`, creating an empty graph if needed.
    fn open_or_create(&mut self, name: &str) -> Result<GraphId, StorageError> {
        match self.find_graph(name)? {
            Some(id) => Ok(id),
            None => self.create_graph(name),
        }
    }

    /// Hex content digest of a stored graph.
    fn digest(&self, id: GraphId) -> Result<String, StorageError> {
        Ok(record_digest(&self.load_graph(id)?).to_hex().to_string())
    }
}

/// Validates and normalizes a record before it is written: auto-stubbed
/// endpoints become explicit stub entities, duplicate edges collapse.
pub(crate) fn normalize(record: &GraphRecord) -> Result<GraphRecord, StorageError> {
    Ok(DependencyGraph::from_record(record.clone())?.to_record())
}
