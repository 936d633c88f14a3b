//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory graph host with scoped transactions
//! - A recording/failing SearchIndex mock
//! - Mapping fixtures and engine setup helpers
//! - Assertions comparing graph entities with indexed documents

#![allow(dead_code)]

pub mod graph;
pub mod mock_index;

pub use graph::*;
pub use mock_index::*;

use graph_index_replicator::document::to_json;
use graph_index_replicator::{
    DocKey, EntityKind, EntitySnapshot, MappingConfig, PropertyValue, ReplicationConfig, ReplicationEngine,
    ReplicationSettings, SearchIndex,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Path of a mapping file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Test config reading a mapping fixture.
pub fn config_with_mapping(file: &str) -> ReplicationConfig {
    ReplicationConfig {
        module_id: "ES".to_string(),
        mapping: MappingConfig::JsonFile { file: fixture(file) },
        settings: ReplicationSettings::for_testing(),
    }
}

/// Route engine logs to the test writer. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Build and start an engine over `graph` and `index`.
pub async fn start_engine<I: SearchIndex>(
    config: ReplicationConfig,
    graph: &MemoryGraph,
    index: Arc<I>,
) -> ReplicationEngine<I> {
    init_tracing();
    let mut engine = ReplicationEngine::from_config(config, index, graph.feed()).expect("valid config");
    engine.start().await.expect("engine starts");
    engine
}

/// Wait until everything committed so far has been dispatched.
///
/// Stopping drains the subscription and the lanes; starting again resumes
/// with the next commit.
pub async fn settle<I: SearchIndex>(engine: &mut ReplicationEngine<I>) {
    engine.stop().await;
    engine.start().await.expect("engine restarts");
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Assert the entity is indexed under `index/doc_type` with every one of its
/// properties.
pub async fn assert_replicated<I: SearchIndex>(
    search: &I,
    entity: &EntitySnapshot,
    index: &str,
    doc_type: &str,
) -> serde_json::Map<String, serde_json::Value> {
    let key = DocKey::new(index, doc_type, key_of(entity));
    let doc = search
        .get(&key)
        .await
        .expect("index reachable")
        .unwrap_or_else(|| panic!("{key} not indexed"));

    for (name, value) in &entity.properties {
        let expected = to_json(value).expect("indexable value");
        assert_eq!(doc.get(name), Some(&expected), "{key}: property {name}");
    }
    assert_eq!(doc.len(), entity.properties.len(), "{key}: unexpected fields {doc:?}");
    doc
}

/// Assert the entity is not indexed under `index/doc_type`.
pub async fn assert_not_replicated<I: SearchIndex>(search: &I, entity: &EntitySnapshot, index: &str, doc_type: &str) {
    assert_key_absent(search, &key_of(entity), index, doc_type).await;
}

pub async fn assert_key_absent<I: SearchIndex>(search: &I, id: &str, index: &str, doc_type: &str) {
    let key = DocKey::new(index, doc_type, id);
    let doc = search.get(&key).await.expect("index reachable");
    assert!(doc.is_none(), "{key} should not be indexed, found {doc:?}");
}

/// Ids of the nodes created by [`write_some_persons`].
#[derive(Debug, Clone, Copy)]
pub struct Persons {
    pub hello: u64,
    pub michal: u64,
    pub adam: u64,
    pub daniela: u64,
    pub graphaware: u64,
    pub michal_works_for: u64,
}

/// Four transactions of people working for a company, the last one touching
/// several entities at once (create, update, delete, property removal).
pub fn write_some_persons(graph: &MemoryGraph) -> Persons {
    // tx 0
    let hello = graph.write(|tx| tx.create_node(&[], [("name", "Hello")]));

    // tx 1
    let (michal, graphaware, michal_works_for) = graph.write(|tx| {
        let michal = tx.create_node(
            &["Person", "Male"],
            [
                ("firstName", "Michal".into()),
                ("lastName", "Bachman".into()),
                ("age", PropertyValue::Int(30)),
            ],
        );
        let ga = tx.create_node(
            &["Company"],
            [("name", "GraphAware".into()), ("est", PropertyValue::Int(2013))],
        );
        let rel = tx.create_relationship(
            michal,
            ga,
            "WORKS_FOR",
            [("since", PropertyValue::Int(2013)), ("role", "MD".into())],
        );
        (michal, ga, rel)
    });

    // tx 2
    let adam = graph.write(|tx| {
        let adam = tx.create_node(&["Person", "Male"], [("firstName", "Adam"), ("lastName", "George")]);
        tx.create_relationship(adam, graphaware, "WORKS_FOR", [("since", 2014)]);
        adam
    });

    // tx 3
    let daniela = graph.write(|tx| {
        let daniela = tx.create_node(&["Person", "Female"], [("firstName", "Daniela"), ("lastName", "Daniela")]);
        tx.create_relationship(daniela, graphaware, "WORKS_FOR", Vec::<(String, String)>::new());
        tx.set_property(EntityKind::Node, michal, "age", 31);
        tx.detach_delete_node(adam);
        tx.remove_property(EntityKind::Relationship, michal_works_for, "role");
        daniela
    });

    Persons {
        hello,
        michal,
        adam,
        daniela,
        graphaware,
        michal_works_for,
    }
}
