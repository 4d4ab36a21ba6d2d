//! Entity and relationship type tags.
//!
//! Both tag sets are open: the well-known variants cover the reference
//! deployment, and anything else round-trips through `Other`. Tags are
//! serialized as snake_case strings so stored graphs stay readable.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of entity a graph node represents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Company,
    Bank,
    Sector,
    Market,
    Instrument,
    Region,
    Asset,
    /// Placeholder type for auto-created edge endpoints.
    Unknown,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Company => "company",
            EntityType::Bank => "bank",
            EntityType::Sector => "sector",
            EntityType::Market => "market",
            EntityType::Instrument => "instrument",
            EntityType::Region => "region",
            EntityType::Asset => "asset",
            EntityType::Unknown => "unknown",
            EntityType::Other(s) => s,
        }
    }
}

impl From<&str> for EntityType {
    fn from(s: &str) -> Self {
        match normalize(s).as_str() {
            "company" => EntityType::Company,
            "bank" => EntityType::Bank,
            "sector" => EntityType::Sector,
            "market" => EntityType::Market,
            "instrument" => EntityType::Instrument,
            "region" => EntityType::Region,
            "asset" => EntityType::Asset,
            "unknown" | "" => EntityType::Unknown,
            other => EntityType::Other(other.to_string()),
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        EntityType::from(s.as_str())
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of influence a directed relationship carries.
///
/// Two edges between the same ordered pair are distinct iff their
/// relationship types differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RelationshipType {
    Exposure,
    Ownership,
    Correlation,
    SupplyChain,
    Credit,
    DependsOn,
    Other(String),
}

impl RelationshipType {
    pub fn as_str(&self) -> &str {
        match self {
            RelationshipType::Exposure => "exposure",
            RelationshipType::Ownership => "ownership",
            RelationshipType::Correlation => "correlation",
            RelationshipType::SupplyChain => "supply_chain",
            RelationshipType::Credit => "credit",
            RelationshipType::DependsOn => "depends_on",
            RelationshipType::Other(s) => s,
        }
    }
}

impl Default for RelationshipType {
    fn default() -> Self {
        RelationshipType::DependsOn
    }
}

impl From<&str> for RelationshipType {
    fn from(s: &str) -> Self {
        match normalize(s).as_str() {
            "exposure" => RelationshipType::Exposure,
            "ownership" => RelationshipType::Ownership,
            "correlation" => RelationshipType::Correlation,
            "supply_chain" => RelationshipType::SupplyChain,
            "credit" => RelationshipType::Credit,
            "depends_on" | "" => RelationshipType::DependsOn,
            other => RelationshipType::Other(other.to_string()),
        }
    }
}

impl From<String> for RelationshipType {
    fn from(s: String) -> Self {
        RelationshipType::from(s.as_str())
    }
}

impl From<RelationshipType> for String {
    fn from(t: RelationshipType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lowercases and folds `-`/space separators into `_`.
fn normalize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_parses_well_known_tags() {
        assert_eq!(EntityType::from("Company"), EntityType::Company);
        assert_eq!(EntityType::from("market"), EntityType::Market);
        assert_eq!(EntityType::from(""), EntityType::Unknown);
        assert_eq!(
            EntityType::from("hedge fund"),
            EntityType::Other("hedge_fund".into())
        );
    }

    #[test]
    fn relationship_type_accepts_kebab_case() {
        assert_eq!(
            RelationshipType::from("supply-chain"),
            RelationshipType::SupplyChain
        );
        assert_eq!(
            RelationshipType::from("supply_chain"),
            RelationshipType::SupplyChain
        );
    }

    #[test]
    fn tags_serialize_as_strings() {
        let json = serde_json::to_string(&RelationshipType::SupplyChain).unwrap();
        assert_eq!(json, "\"supply_chain\"");
        let back: RelationshipType = serde_json::from_str("\"guarantee\"").unwrap();
        assert_eq!(back, RelationshipType::Other("guarantee".into()));

        let json = serde_json::to_string(&EntityType::Instrument).unwrap();
        assert_eq!(json, "\"instrument\"");
    }

    #[test]
    fn default_relationship_is_depends_on() {
        assert_eq!(RelationshipType::default(), RelationshipType::DependsOn);
    }
}
