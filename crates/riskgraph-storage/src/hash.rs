//! Deterministic content digests for stored graphs using blake3.
//!
//! The digest covers every entity and relationship field. It is canonical:
//!
//! - entities are hashed in id order,
//! - relationships in `(source, target, type)` order,
//! - attribute keys in sorted order,
//!
//! so two records with the same content hash identically no matter how
//! they were built or stored. Every variable-length field is length-prefixed.

use std::collections::BTreeMap;

use riskgraph_core::{Attributes, Entity, GraphRecord, Relationship};

/// Digest of a whole graph record.
pub fn record_digest(record: &GraphRecord) -> blake3::Hash {
    let mut nodes: Vec<&Entity> = record.nodes.iter().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    let mut edges: Vec<&Relationship> = record.edges.iter().collect();
    edges.sort_by(|a, b| {
        (&a.source_id, &a.target_id, &a.relationship_type).cmp(&(
            &b.source_id,
            &b.target_id,
            &b.relationship_type,
        ))
    });

    let mut hasher = blake3::Hasher::new();
    hasher.update(&(nodes.len() as u64).to_le_bytes());
    for entity in nodes {
        hasher.update(entity_digest(entity).as_bytes());
    }
    hasher.update(&(edges.len() as u64).to_le_bytes());
    for rel in edges {
        hasher.update(relationship_digest(rel).as_bytes());
    }
    hasher.finalize()
}

pub fn entity_digest(entity: &Entity) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    update_str(&mut hasher, &entity.id);
    update_str(&mut hasher, entity.entity_type.as_str());
    hasher.update(&entity.risk_score.to_bits().to_le_bytes());
    hasher.update(&[entity.stub as u8]);
    update_attributes(&mut hasher, &entity.attributes);
    hasher.finalize()
}

pub fn relationship_digest(rel: &Relationship) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    update_str(&mut hasher, &rel.source_id);
    update_str(&mut hasher, &rel.target_id);
    update_str(&mut hasher, rel.relationship_type.as_str());
    hasher.update(&rel.weight.to_bits().to_le_bytes());
    update_attributes(&mut hasher, &rel.attributes);
    hasher.finalize()
}

fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}

fn update_attributes(hasher: &mut blake3::Hasher, attributes: &Attributes) {
    let sorted: BTreeMap<&String, &serde_json::Value> = attributes.iter().collect();
    hasher.update(&(sorted.len() as u64).to_le_bytes());
    for (key, value) in sorted {
        update_str(hasher, key);
        // serde_json's default map is ordered, so nested objects are canonical too.
        update_str(hasher, &value.to_string());
    }
}
