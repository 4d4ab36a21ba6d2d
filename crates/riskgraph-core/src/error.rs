//! Errors raised by graph mutations and snapshot commits.
//!
//! A rejected upsert or bulk load reports `Validation` and leaves the graph
//! untouched. Removing something that does not exist reports the missing
//! id. A commit against an outdated generation reports `GraphConsistency`.

use thiserror::Error;

use crate::kind::RelationshipType;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Malformed node, edge, or bulk-load input. Rejected before any
    /// mutation is applied.
    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: String, reason: String },

    /// An entity id was not found in the graph.
    #[error("entity not found: '{id}'")]
    NodeNotFound { id: String },

    /// No relationship of the given type exists between the pair.
    #[error("relationship not found: '{source_id}' -[{kind}]-> '{target_id}'")]
    EdgeNotFound {
        source_id: String,
        target_id: String,
        kind: RelationshipType,
    },

    /// Bookkeeping disagreed with the graph. Stale commits land here too.
    #[error("graph consistency violated: {reason}")]
    GraphConsistency { reason: String },
}

impl CoreError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for input validation failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, CoreError::Validation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_item() {
        let err = CoreError::validation("weight", "1.5 is outside [0, 1]");
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "validation failed for `weight`: 1.5 is outside [0, 1]");

        let err = CoreError::EdgeNotFound {
            source_id: "acme".into(),
            target_id: "bank-1".into(),
            kind: RelationshipType::Credit,
        };
        assert!(!err.is_validation());
        assert_eq!(
            err.to_string(),
            "relationship not found: 'acme' -[credit]-> 'bank-1'"
        );
    }
}
