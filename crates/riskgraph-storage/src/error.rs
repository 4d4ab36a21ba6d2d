//! Storage error types for riskgraph-storage.

use thiserror::Error;

use riskgraph_core::CoreError;

/// Errors produced by storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Applying schema migrations failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// No stored graph has the given id.
    #[error("graph not found: {0}")]
    GraphNotFound(i64),

    /// A graph with this name already exists.
    #[error("graph name already in use: '{0}'")]
    DuplicateName(String),

    /// Stored or incoming data violates a graph invariant.
    #[error(transparent)]
    Core(#[from] CoreError),
}
