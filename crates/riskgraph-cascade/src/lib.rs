//! CascadeEngine: stateless analytical queries over a dependency graph
//! snapshot.
//!
//! Every function here takes `&DependencyGraph` (a [`GraphSnapshot`] derefs
//! to one) and never mutates it, so queries need no locking.
//!
//! [`GraphSnapshot`]: riskgraph_core::GraphSnapshot

pub mod clustering;
pub mod config;
pub mod error;
pub mod hotspots;
pub mod paths;
pub mod propagation;
pub mod stats;

pub use clustering::{clusters, ClusterMethod, ClusterParams, ClusterResult, ClusterSummary};
pub use config::{CascadeConfig, CascadeEngine};
pub use error::CascadeError;
pub use hotspots::{hotspots, Hotspot, HotspotParams};
pub use paths::{critical_paths, shortest_path, InfluencePath, PathHop, PathIter, PathSearch};
pub use propagation::{propagate, CascadeEntry, CascadeResult, DepthSummary, PropagationParams};
pub use stats::{statistics, GraphStatistics};
