//! Persistence for riskgraph dependency graphs.
//!
//! Provides the [`GraphStore`] trait that every backend implements, plus
//! [`InMemoryStore`] and [`SqliteStore`].
//!
//! # Modules
//!
//! - [`error`]: StorageError
//! - [`types`]: GraphId, GraphSummary
//! - [`traits`]: GraphStore
//! - [`hash`]: canonical blake3 content digests
//! - [`memory`]: InMemoryStore
//! - [`schema`]: migrations for the SQLite backend
//! - [`sqlite`]: SqliteStore

pub mod error;
pub mod hash;
pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod traits;
pub mod types;

pub use error::StorageError;
pub use hash::{entity_digest, record_digest, relationship_digest};
pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use traits::GraphStore;
pub use types::{GraphId, GraphSummary};
