//! SQLite implementation of [`GraphStore`].
//!
//! [`SqliteStore`] keeps graphs in three tables (`graphs`, `entities`,
//! `relationships`) with WAL mode, foreign keys, and one transaction per
//! write. Attribute bags are stored as JSON TEXT columns.

use rusqlite::{params, Connection, OptionalExtension};

use riskgraph_core::{
    Attributes, CoreError, EdgeUpsertOutcome, Entity, EntityType, GraphRecord, NodeUpsert,
    Relationship, RelationshipType, UpsertKind,
};

use crate::error::StorageError;
use crate::hash::record_digest;
use crate::traits::{normalize, GraphStore};
use crate::types::{unix_millis, GraphId, GraphSummary};

/// SQLite-backed implementation of [`GraphStore`].
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Opens (or creates) a SQLite database at `path`.
    pub fn new(path: &str) -> Result<Self, StorageError> {
        let conn = crate::schema::open_database(path)?;
        Ok(SqliteStore { conn })
    }

    /// Opens an in-memory SQLite database (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = crate::schema::open_in_memory()?;
        Ok(SqliteStore { conn })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn assert_graph_exists(conn: &Connection, id: GraphId) -> Result<(), StorageError> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM graphs WHERE id = ?1)",
        params![id.0],
        |row| row.get(0),
    )?;
    if !exists {
        return Err(StorageError::GraphNotFound(id.0));
    }
    Ok(())
}

fn touch(conn: &Connection, id: GraphId) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE graphs SET updated_at = ?2 WHERE id = ?1",
        params![id.0, unix_millis() as i64],
    )?;
    Ok(())
}

fn insert_entity(conn: &Connection, id: GraphId, entity: &Entity) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO entities (graph_id, id, entity_type, risk_score, attributes, stub)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.0,
            entity.id,
            entity.entity_type.as_str(),
            entity.risk_score,
            serde_json::to_string(&entity.attributes)?,
            entity.stub,
        ],
    )?;
    Ok(())
}

fn insert_relationship(
    conn: &Connection,
    id: GraphId,
    rel: &Relationship,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO relationships
             (graph_id, source_id, target_id, relationship_type, weight, attributes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            id.0,
            rel.source_id,
            rel.target_id,
            rel.relationship_type.as_str(),
            rel.weight,
            serde_json::to_string(&rel.attributes)?,
        ],
    )?;
    Ok(())
}

impl GraphStore for SqliteStore {
    fn create_graph(&mut self, name: &str) -> Result<GraphId, StorageError> {
        if self.find_graph(name)?.is_some() {
            return Err(StorageError::DuplicateName(name.to_string()));
        }
        let now = unix_millis() as i64;
        self.conn.execute(
            "INSERT INTO graphs (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![name, now],
        )?;
        Ok(GraphId(self.conn.last_insert_rowid()))
    }

    fn find_graph(&self, name: &str) -> Result<Option<GraphId>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM graphs WHERE name = ?1",
                params![name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .map(GraphId))
    }

    fn save_graph(&mut self, id: GraphId, record: &GraphRecord) -> Result<(), StorageError> {
        let record = normalize(record)?;
        let tx = self.conn.transaction()?;
        assert_graph_exists(&tx, id)?;

        tx.execute("DELETE FROM relationships WHERE graph_id = ?1", params![id.0])?;
        tx.execute("DELETE FROM entities WHERE graph_id = ?1", params![id.0])?;
        for entity in &record.nodes {
            insert_entity(&tx, id, entity)?;
        }
        for rel in &record.edges {
            insert_relationship(&tx, id, rel)?;
        }
        touch(&tx, id)?;
        tx.commit()?;

        tracing::debug!(
            graph = id.0,
            nodes = record.nodes.len(),
            edges = record.edges.len(),
            "saved graph"
        );
        Ok(())
    }

    fn load_graph(&self, id: GraphId) -> Result<GraphRecord, StorageError> {
        assert_graph_exists(&self.conn, id)?;

        let mut stmt = self.conn.prepare(
            "SELECT id, entity_type, risk_score, attributes, stub
             FROM entities WHERE graph_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })?;
        let mut nodes = Vec::new();
        for row in rows {
            let (entity_id, entity_type, risk_score, attributes, stub) = row?;
            nodes.push(Entity {
                id: entity_id,
                entity_type: EntityType::from(entity_type),
                risk_score,
                attributes: serde_json::from_str(&attributes)?,
                stub,
            });
        }

        let mut stmt = self.conn.prepare(
            "SELECT source_id, target_id, relationship_type, weight, attributes
             FROM relationships WHERE graph_id = ?1",
        )?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let (source_id, target_id, kind, weight, attributes) = row?;
            edges.push(Relationship {
                source_id,
                target_id,
                relationship_type: RelationshipType::from(kind),
                weight,
                attributes: serde_json::from_str(&attributes)?,
            });
        }
        edges.sort_by(|a, b| {
            (&a.source_id, &a.target_id, &a.relationship_type).cmp(&(
                &b.source_id,
                &b.target_id,
                &b.relationship_type,
            ))
        });

        Ok(GraphRecord { nodes, edges })
    }

    fn delete_graph(&mut self, id: GraphId) -> Result<(), StorageError> {
        let deleted = self
            .conn
            .execute("DELETE FROM graphs WHERE id = ?1", params![id.0])?;
        if deleted == 0 {
            return Err(StorageError::GraphNotFound(id.0));
        }
        Ok(())
    }

    fn list_graphs(&self) -> Result<Vec<GraphSummary>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, updated_at FROM graphs ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (raw_id, name, updated_at) = row?;
            let id = GraphId(raw_id);
            let record = self.load_graph(id)?;
            summaries.push(GraphSummary {
                id,
                name,
                node_count: record.nodes.len(),
                edge_count: record.edges.len(),
                digest: record_digest(&record).to_hex().to_string(),
                updated_at: updated_at.max(0) as u64,
            });
        }
        Ok(summaries)
    }

    fn upsert_entity(
        &mut self,
        id: GraphId,
        upsert: &NodeUpsert,
    ) -> Result<UpsertKind, StorageError> {
        upsert.validate()?;
        let tx = self.conn.transaction()?;
        assert_graph_exists(&tx, id)?;

        let existing = tx
            .query_row(
                "SELECT entity_type, risk_score, attributes FROM entities
                 WHERE graph_id = ?1 AND id = ?2",
                params![id.0, upsert.id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let kind = match existing {
            Some((entity_type, risk_score, attributes)) => {
                let mut merged: Attributes = serde_json::from_str(&attributes)?;
                merged.extend(upsert.attributes.clone());
                let entity_type = upsert
                    .entity_type
                    .as_ref()
                    .map(|t| t.as_str().to_string())
                    .unwrap_or(entity_type);
                tx.execute(
                    "UPDATE entities SET entity_type = ?3, risk_score = ?4, attributes = ?5, stub = 0
                     WHERE graph_id = ?1 AND id = ?2",
                    params![
                        id.0,
                        upsert.id,
                        entity_type,
                        upsert.risk_score.unwrap_or(risk_score),
                        serde_json::to_string(&merged)?,
                    ],
                )?;
                UpsertKind::Updated
            }
            None => {
                let entity = Entity {
                    id: upsert.id.clone(),
                    entity_type: upsert.entity_type.clone().unwrap_or(EntityType::Unknown),
                    risk_score: upsert.risk_score.unwrap_or(0.0),
                    attributes: upsert.attributes.clone(),
                    stub: false,
                };
                insert_entity(&tx, id, &entity)?;
                UpsertKind::Created
            }
        };

        touch(&tx, id)?;
        tx.commit()?;
        Ok(kind)
    }

    fn upsert_relationship(
        &mut self,
        id: GraphId,
        relationship: &Relationship,
    ) -> Result<EdgeUpsertOutcome, StorageError> {
        relationship.validate()?;
        let tx = self.conn.transaction()?;
        assert_graph_exists(&tx, id)?;

        let mut stubbed = Vec::new();
        for endpoint in [&relationship.source_id, &relationship.target_id] {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO entities (graph_id, id, entity_type, risk_score, attributes, stub)
                 VALUES (?1, ?2, 'unknown', 0.0, '{}', 1)",
                params![id.0, endpoint],
            )?;
            if inserted == 1 {
                stubbed.push(endpoint.clone());
            }
        }

        let kind_tag = relationship.relationship_type.as_str();
        let existing = tx
            .query_row(
                "SELECT attributes FROM relationships
                 WHERE graph_id = ?1 AND source_id = ?2 AND target_id = ?3 AND relationship_type = ?4",
                params![id.0, relationship.source_id, relationship.target_id, kind_tag],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let kind = match existing {
            Some(attributes) => {
                let mut merged: Attributes = serde_json::from_str(&attributes)?;
                merged.extend(relationship.attributes.clone());
                tx.execute(
                    "UPDATE relationships SET weight = ?5, attributes = ?6
                     WHERE graph_id = ?1 AND source_id = ?2 AND target_id = ?3 AND relationship_type = ?4",
                    params![
                        id.0,
                        relationship.source_id,
                        relationship.target_id,
                        kind_tag,
                        relationship.weight,
                        serde_json::to_string(&merged)?,
                    ],
                )?;
                UpsertKind::Updated
            }
            None => {
                insert_relationship(&tx, id, relationship)?;
                UpsertKind::Created
            }
        };

        touch(&tx, id)?;
        tx.commit()?;

        if !stubbed.is_empty() {
            tracing::debug!(graph = id.0, stubbed = ?stubbed, "stored stub entities for edge endpoints");
        }
        Ok(EdgeUpsertOutcome { kind, stubbed })
    }

    fn remove_entity(&mut self, id: GraphId, entity_id: &str) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        assert_graph_exists(&tx, id)?;
        // Incident relationships go with it through ON DELETE CASCADE.
        let deleted = tx.execute(
            "DELETE FROM entities WHERE graph_id = ?1 AND id = ?2",
            params![id.0, entity_id],
        )?;
        if deleted == 0 {
            return Err(CoreError::NodeNotFound {
                id: entity_id.to_string(),
            }
            .into());
        }
        touch(&tx, id)?;
        tx.commit()?;
        Ok(())
    }
}
