//! Graph node and edge payloads, plus the upsert inputs that produce them.
//!
//! Scores and weights are validated, never clamped: any value outside
//! `[0, 1]` (or a non-finite value) is a [`CoreError::Validation`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::kind::{EntityType, RelationshipType};

/// Open key-value bag carried by entities and relationships. Insertion
/// order is preserved.
pub type Attributes = IndexMap<String, serde_json::Value>;

/// A graph node: one financial entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    pub risk_score: f64,
    #[serde(default)]
    pub attributes: Attributes,
    /// `true` while the node only exists because an edge referenced it.
    #[serde(default)]
    pub stub: bool,
}

impl Entity {
    /// A placeholder endpoint created by an edge upsert.
    pub fn stub(id: impl Into<String>) -> Self {
        Entity {
            id: id.into(),
            entity_type: EntityType::Unknown,
            risk_score: 0.0,
            attributes: Attributes::new(),
            stub: true,
        }
    }
}

/// A directed, weighted, typed influence edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(default)]
    pub relationship_type: RelationshipType,
    pub weight: f64,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Relationship {
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: RelationshipType,
        weight: f64,
    ) -> Self {
        Relationship {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type,
            weight,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Checks ids and weight without touching any graph.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_id("source_id", &self.source_id)?;
        validate_id("target_id", &self.target_id)?;
        validate_unit_interval("weight", self.weight)
    }
}

/// Input for [`DependencyGraph::upsert_node`](crate::graph::DependencyGraph::upsert_node).
///
/// Fields left as `None` keep the existing value on update. A newly created
/// node gets type `unknown` and score `0` unless given. Attributes are merged
/// key by key, latest write wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpsert {
    pub id: String,
    #[serde(default)]
    pub entity_type: Option<EntityType>,
    #[serde(default)]
    pub risk_score: Option<f64>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl NodeUpsert {
    pub fn new(id: impl Into<String>) -> Self {
        NodeUpsert {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn entity_type(mut self, entity_type: EntityType) -> Self {
        self.entity_type = Some(entity_type);
        self
    }

    pub fn risk_score(mut self, score: f64) -> Self {
        self.risk_score = Some(score);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_id("id", &self.id)?;
        if let Some(score) = self.risk_score {
            validate_unit_interval("risk_score", score)?;
        }
        Ok(())
    }
}

impl From<Entity> for NodeUpsert {
    fn from(entity: Entity) -> Self {
        NodeUpsert {
            id: entity.id,
            entity_type: Some(entity.entity_type),
            risk_score: Some(entity.risk_score),
            attributes: entity.attributes,
        }
    }
}

pub(crate) fn validate_id(field: &str, id: &str) -> Result<(), CoreError> {
    if id.trim().is_empty() {
        return Err(CoreError::validation(field, "must not be empty"));
    }
    Ok(())
}

/// Accepts finite values in `[0, 1]`.
pub fn validate_unit_interval(field: &str, value: f64) -> Result<(), CoreError> {
    if !value.is_finite() {
        return Err(CoreError::validation(field, format!("{value} is not finite")));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(CoreError::validation(
            field,
            format!("{value} is outside [0, 1]"),
        ));
    }
    Ok(())
}
