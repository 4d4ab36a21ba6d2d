//! Concurrent access to the dependency graph.
//!
//! [`SharedGraph`] holds the current graph generation behind an `ArcSwap`.
//! Readers take a [`GraphSnapshot`] (an `Arc` to one immutable generation)
//! without locking; a long-running analysis never observes a write that
//! lands after it started. Writers serialize on a single mutex, clone the
//! current generation, mutate the clone, and publish it with one atomic
//! pointer swap (RCU style). A write closure that fails publishes nothing.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use crate::entity::{Entity, NodeUpsert, Relationship};
use crate::error::CoreError;
use crate::graph::{DependencyGraph, EdgeUpsertOutcome, UpsertKind};
use crate::record::GraphRecord;

/// An immutable view of one graph generation.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    graph: Arc<DependencyGraph>,
}

impl GraphSnapshot {
    /// Wraps a standalone graph, e.g. one loaded from storage.
    pub fn new(graph: DependencyGraph) -> Self {
        GraphSnapshot {
            graph: Arc::new(graph),
        }
    }

    /// Clones the snapshot into a mutable graph, to be committed with
    /// [`SharedGraph::try_commit`].
    pub fn to_graph(&self) -> DependencyGraph {
        DependencyGraph::clone(&self.graph)
    }

    pub fn ptr_eq(&self, other: &GraphSnapshot) -> bool {
        Arc::ptr_eq(&self.graph, &other.graph)
    }
}

impl Deref for GraphSnapshot {
    type Target = DependencyGraph;

    fn deref(&self) -> &DependencyGraph {
        &self.graph
    }
}

impl From<DependencyGraph> for GraphSnapshot {
    fn from(graph: DependencyGraph) -> Self {
        GraphSnapshot::new(graph)
    }
}

/// Single-writer, many-reader handle to the live dependency graph.
#[derive(Debug)]
pub struct SharedGraph {
    current: ArcSwap<DependencyGraph>,
    writer: Mutex<()>,
}

impl Default for SharedGraph {
    fn default() -> Self {
        Self::new(DependencyGraph::new())
    }
}

impl SharedGraph {
    pub fn new(graph: DependencyGraph) -> Self {
        SharedGraph {
            current: ArcSwap::from_pointee(graph),
            writer: Mutex::new(()),
        }
    }

    /// Current generation. Never blocks on writers.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            graph: self.current.load_full(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation()
    }

    /// Applies `f` to a private copy of the graph and publishes the copy if
    /// `f` succeeds and changed anything.
    ///
    /// All mutations made inside one closure become visible together.
    pub fn write<T, E>(
        &self,
        f: impl FnOnce(&mut DependencyGraph) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<CoreError>,
    {
        let _guard = self.lock_writer()?;
        let base = self.current.load_full();
        let mut next = DependencyGraph::clone(&base);

        let out = f(&mut next)?;

        if next.generation() != base.generation() {
            tracing::debug!(
                from = base.generation(),
                to = next.generation(),
                nodes = next.node_count(),
                edges = next.edge_count(),
                "publishing graph generation"
            );
            self.current.store(Arc::new(next));
        }
        Ok(out)
    }

    /// Publishes `graph` only if no other write landed since generation
    /// `base_generation` was read.
    pub fn try_commit(
        &self,
        base_generation: u64,
        mut graph: DependencyGraph,
    ) -> Result<u64, CoreError> {
        let _guard = self.lock_writer()?;
        let current = self.current.load().generation();
        if current != base_generation {
            return Err(CoreError::GraphConsistency {
                reason: format!(
                    "stale commit: based on generation {base_generation}, current is {current}"
                ),
            });
        }
        if graph.generation() <= current {
            graph.set_generation(current + 1);
        }
        let generation = graph.generation();
        self.current.store(Arc::new(graph));
        Ok(generation)
    }

    /// Replaces the whole graph with the contents of `record`.
    ///
    /// The record is fully validated first; an invalid record leaves the
    /// current graph in place.
    pub fn bulk_load(&self, record: GraphRecord) -> Result<u64, CoreError> {
        let mut graph = DependencyGraph::from_record(record)?;
        let _guard = self.lock_writer()?;
        let generation = self.current.load().generation() + 1;
        graph.set_generation(generation);
        tracing::info!(
            generation,
            nodes = graph.node_count(),
            edges = graph.edge_count(),
            "bulk-loaded dependency graph"
        );
        self.current.store(Arc::new(graph));
        Ok(generation)
    }

    pub fn upsert_node(&self, upsert: NodeUpsert) -> Result<UpsertKind, CoreError> {
        self.write(|graph| graph.upsert_node(upsert))
    }

    pub fn upsert_edge(&self, relationship: Relationship) -> Result<EdgeUpsertOutcome, CoreError> {
        self.write(|graph| graph.upsert_edge(relationship))
    }

    pub fn remove_node(&self, id: &str) -> Result<Entity, CoreError> {
        self.write(|graph| graph.remove_node(id))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, CoreError> {
        self.writer.lock().map_err(|_| CoreError::GraphConsistency {
            reason: "graph writer lock poisoned".to_string(),
        })
    }
}
