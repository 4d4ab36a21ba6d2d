//! Errors produced by cascade queries.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CascadeError {
    /// A query referenced an entity missing from the snapshot.
    #[error("entity not found in snapshot: '{id}'")]
    NodeNotFound { id: String },

    /// A query or configuration parameter is out of range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: String, reason: String },
}

impl CascadeError {
    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        CascadeError::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}
