//! Behaviour shared by every GraphStore backend.

use riskgraph_core::{
    CoreError, DependencyGraph, EntityType, GraphRecord, NodeUpsert, Relationship,
    RelationshipType, UpsertKind,
};
use riskgraph_storage::{GraphStore, InMemoryStore, SqliteStore, StorageError};
use serde_json::json;

fn sample_record() -> GraphRecord {
    let mut graph = DependencyGraph::new();
    graph
        .upsert_node(
            NodeUpsert::new("acme")
                .entity_type(EntityType::Company)
                .risk_score(0.35)
                .attribute("country", json!("US")),
        )
        .unwrap();
    graph
        .upsert_edge(Relationship::new("acme", "bank-1", RelationshipType::Credit, 0.6))
        .unwrap();
    graph
        .upsert_edge(
            Relationship::new("acme", "bank-1", RelationshipType::Exposure, 0.2)
                .with_attribute("notional", json!(1_000_000)),
        )
        .unwrap();
    graph.to_record()
}

fn each_backend(check: impl Fn(&mut dyn GraphStore)) {
    check(&mut InMemoryStore::new());
    check(&mut SqliteStore::in_memory().unwrap());
}

#[test]
fn save_then_load_roundtrips() {
    each_backend(|store| {
        let id = store.create_graph("book").unwrap();
        let record = sample_record();
        store.save_graph(id, &record).unwrap();
        assert_eq!(store.load_graph(id).unwrap(), record);

        let graph = store.load_dependency_graph(id).unwrap();
        assert!(graph.get_node("bank-1").unwrap().stub);
        assert_eq!(graph.edge_count(), 2);
    });
}

#[test]
fn digests_agree_across_backends() {
    let mut memory = InMemoryStore::new();
    let mut sqlite = SqliteStore::in_memory().unwrap();
    let a = memory.create_graph("g").unwrap();
    let b = sqlite.create_graph("g").unwrap();
    memory.save_graph(a, &sample_record()).unwrap();
    sqlite.save_graph(b, &sample_record()).unwrap();
    assert_eq!(memory.digest(a).unwrap(), sqlite.digest(b).unwrap());

    let listed = sqlite.list_graphs().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].node_count, 2);
    assert_eq!(listed[0].edge_count, 2);
    assert_eq!(listed[0].digest, sqlite.digest(b).unwrap());
}

#[test]
fn incremental_upserts_follow_graph_semantics() {
    each_backend(|store| {
        let id = store.create_graph("live").unwrap();

        let outcome = store
            .upsert_relationship(id, &Relationship::new("a", "b", RelationshipType::Exposure, 0.5))
            .unwrap();
        assert_eq!(outcome.kind, UpsertKind::Created);
        assert_eq!(outcome.stubbed, vec!["a".to_string(), "b".to_string()]);

        let outcome = store
            .upsert_relationship(id, &Relationship::new("a", "b", RelationshipType::Exposure, 0.9))
            .unwrap();
        assert_eq!(outcome.kind, UpsertKind::Updated);
        assert!(outcome.stubbed.is_empty());

        let kind = store
            .upsert_entity(id, &NodeUpsert::new("a").entity_type(EntityType::Bank).risk_score(0.7))
            .unwrap();
        assert_eq!(kind, UpsertKind::Updated);

        let record = store.load_graph(id).unwrap();
        assert_eq!(record.edges.len(), 1);
        assert_eq!(record.edges[0].weight, 0.9);
        let a = record.nodes.iter().find(|n| n.id == "a").unwrap();
        assert!(!a.stub);
        assert_eq!(a.entity_type, EntityType::Bank);
        assert_eq!(a.risk_score, 0.7);
    });
}

#[test]
fn invalid_writes_change_nothing() {
    each_backend(|store| {
        let id = store.create_graph("strict").unwrap();
        store.save_graph(id, &sample_record()).unwrap();
        let before = store.load_graph(id).unwrap();

        let err = store
            .upsert_relationship(id, &Relationship::new("acme", "ghost", RelationshipType::Credit, 1.5))
            .unwrap_err();
        assert!(matches!(err, StorageError::Core(CoreError::Validation { .. })));
        let err = store
            .upsert_entity(id, &NodeUpsert::new("acme").risk_score(-0.1))
            .unwrap_err();
        assert!(matches!(err, StorageError::Core(CoreError::Validation { .. })));

        let mut bad = sample_record();
        bad.edges[0].weight = 2.0;
        assert!(store.save_graph(id, &bad).is_err());

        assert_eq!(store.load_graph(id).unwrap(), before);
    });
}

#[test]
fn remove_entity_drops_incident_relationships() {
    each_backend(|store| {
        let id = store.create_graph("removal").unwrap();
        store.save_graph(id, &sample_record()).unwrap();
        store.remove_entity(id, "bank-1").unwrap();

        let record = store.load_graph(id).unwrap();
        assert_eq!(record.nodes.len(), 1);
        assert!(record.edges.is_empty());
        assert!(matches!(
            store.remove_entity(id, "bank-1"),
            Err(StorageError::Core(CoreError::NodeNotFound { .. }))
        ));
    });
}

#[test]
fn graph_lifecycle_errors() {
    each_backend(|store| {
        let id = store.create_graph("one").unwrap();
        assert!(matches!(
            store.create_graph("one"),
            Err(StorageError::DuplicateName(_))
        ));
        assert_eq!(store.find_graph("one").unwrap(), Some(id));
        assert_eq!(store.open_or_create("one").unwrap(), id);

        store.delete_graph(id).unwrap();
        assert!(matches!(store.load_graph(id), Err(StorageError::GraphNotFound(_))));
        assert!(store.find_graph("one").unwrap().is_none());
    });
}

#[test]
fn sqlite_file_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("risk.db");
    let path = path.to_str().unwrap();

    let id = {
        let mut store = SqliteStore::new(path).unwrap();
        let id = store.create_graph("durable").unwrap();
        store.save_graph(id, &sample_record()).unwrap();
        id
    };

    let store = SqliteStore::new(path).unwrap();
    assert_eq!(store.find_graph("durable").unwrap(), Some(id));
    assert_eq!(store.load_graph(id).unwrap(), sample_record());
}
