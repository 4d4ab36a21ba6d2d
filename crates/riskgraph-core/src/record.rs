//! Persistence shape of a dependency graph.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Relationship};

/// Flat node and edge lists, the form graphs take on disk and over the CLI.
///
/// Edges may name endpoints missing from `nodes`; loading applies the
/// auto-stub rule to them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphRecord {
    #[serde(default)]
    pub nodes: Vec<Entity>,
    #[serde(default)]
    pub edges: Vec<Relationship>,
}

impl GraphRecord {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }
}
