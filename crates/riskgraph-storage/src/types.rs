//! Storage-layer types for graph identity and metadata.
//!
//! [`GraphId`] lives here rather than in riskgraph-core because graphs only
//! gain an id when persisted.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a stored graph. Aligns with SQLite's `INTEGER PRIMARY KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GraphId(pub i64);

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GraphId({})", self.0)
    }
}

/// Listing entry for a stored graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub id: GraphId,
    pub name: String,
    pub node_count: usize,
    pub edge_count: usize,
    /// Hex blake3 digest of the canonical graph content.
    pub digest: String,
    /// Unix milliseconds of the last write.
    pub updated_at: u64,
}

pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
