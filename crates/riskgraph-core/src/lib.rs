pub mod entity;
pub mod error;
pub mod graph;
pub mod kind;
pub mod record;
pub mod shared;

// Re-export commonly used types
pub use entity::{validate_unit_interval, Attributes, Entity, NodeUpsert, Relationship};
pub use error::CoreError;
pub use graph::{DependencyGraph, Direction, EdgeUpsertOutcome, EntityGraph, Neighbor, UpsertKind};
pub use kind::{EntityType, RelationshipType};
pub use record::GraphRecord;
pub use shared::{GraphSnapshot, SharedGraph};
