//! In-memory graph host for integration tests.
//!
//! Plays the part of the database: scoped transactions that publish their
//! before/after diffs to a [`CommitFeed`] when committed, and publish nothing
//! when rolled back. Nodes get a random `uuid` key on creation, like a host
//! with a key-assigning module would do.

#![allow(dead_code)]

use graph_index_replicator::{CommitFeed, EntityDiff, EntityKind, EntitySnapshot, PropertyValue};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

pub const KEY_PROPERTY: &str = "uuid";

#[derive(Debug, Clone)]
struct Relationship {
    start: u64,
    end: u64,
    snapshot: EntitySnapshot,
}

#[derive(Debug, Clone, Default)]
struct GraphState {
    next_id: u64,
    nodes: BTreeMap<u64, EntitySnapshot>,
    relationships: BTreeMap<u64, Relationship>,
}

impl GraphState {
    fn snapshot(&self, kind: EntityKind, id: u64) -> Option<EntitySnapshot> {
        match kind {
            EntityKind::Node => self.nodes.get(&id).cloned(),
            EntityKind::Relationship => self.relationships.get(&id).map(|r| r.snapshot.clone()),
        }
    }
}

/// The host database.
#[derive(Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    feed: Arc<CommitFeed>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit feed the replication engine subscribes to.
    pub fn feed(&self) -> Arc<CommitFeed> {
        Arc::clone(&self.feed)
    }

    /// Begin a transaction. It rolls back on drop unless marked successful.
    pub fn begin(&self) -> Transaction<'_> {
        let working = self.state.lock().unwrap().clone();
        Transaction {
            graph: self,
            working,
            before: HashMap::new(),
            order: Vec::new(),
            success: false,
        }
    }

    /// Run `f` in a transaction and commit it.
    pub fn write<R>(&self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut tx = self.begin();
        let result = f(&mut tx);
        tx.success();
        result
    }

    pub fn node(&self, id: u64) -> Option<EntitySnapshot> {
        self.state.lock().unwrap().nodes.get(&id).cloned()
    }

    pub fn relationship(&self, id: u64) -> Option<EntitySnapshot> {
        self.state.lock().unwrap().relationships.get(&id).map(|r| r.snapshot.clone())
    }

    pub fn nodes_with_label(&self, label: &str) -> Vec<EntitySnapshot> {
        self.state
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.labels.contains(label))
            .cloned()
            .collect()
    }

    pub fn all_nodes(&self) -> Vec<EntitySnapshot> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn all_relationships(&self) -> Vec<EntitySnapshot> {
        self.state
            .lock()
            .unwrap()
            .relationships
            .values()
            .map(|r| r.snapshot.clone())
            .collect()
    }
}

/// Key of an entity snapshot.
pub fn key_of(snapshot: &EntitySnapshot) -> String {
    snapshot
        .property(KEY_PROPERTY)
        .and_then(PropertyValue::as_str)
        .expect("entity has a key")
        .to_string()
}

/// A scoped write transaction.
pub struct Transaction<'g> {
    graph: &'g MemoryGraph,
    working: GraphState,
    /// Committed state of every touched entity, taken at first touch
    before: HashMap<(EntityKind, u64), Option<EntitySnapshot>>,
    order: Vec<(EntityKind, u64)>,
    success: bool,
}

impl Transaction<'_> {
    /// Mark the transaction to commit on drop.
    pub fn success(&mut self) {
        self.success = true;
    }

    fn touch(&mut self, kind: EntityKind, id: u64) {
        if !self.before.contains_key(&(kind, id)) {
            self.before.insert((kind, id), self.working.snapshot(kind, id));
            self.order.push((kind, id));
        }
    }

    fn next_id(&mut self) -> u64 {
        self.working.next_id += 1;
        self.working.next_id
    }

    pub fn create_node<P, K, V>(&mut self, labels: &[&str], properties: P) -> u64
    where
        P: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        let id = self.next_id();
        self.touch(EntityKind::Node, id);
        let mut snapshot = EntitySnapshot::new(labels.iter().copied(), properties);
        snapshot
            .properties
            .entry(KEY_PROPERTY.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string().into());
        self.working.nodes.insert(id, snapshot);
        id
    }

    pub fn create_relationship<P, K, V>(&mut self, start: u64, end: u64, rel_type: &str, properties: P) -> u64
    where
        P: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        assert!(self.working.nodes.contains_key(&start) && self.working.nodes.contains_key(&end));
        let id = self.next_id();
        self.touch(EntityKind::Relationship, id);
        let mut snapshot = EntitySnapshot::new([rel_type], properties);
        snapshot
            .properties
            .entry(KEY_PROPERTY.to_string())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string().into());
        self.working.relationships.insert(id, Relationship { start, end, snapshot });
        id
    }

    fn entity_mut(&mut self, kind: EntityKind, id: u64) -> &mut EntitySnapshot {
        self.touch(kind, id);
        match kind {
            EntityKind::Node => self.working.nodes.get_mut(&id).expect("node exists"),
            EntityKind::Relationship => {
                &mut self.working.relationships.get_mut(&id).expect("relationship exists").snapshot
            }
        }
    }

    pub fn set_property(&mut self, kind: EntityKind, id: u64, name: &str, value: impl Into<PropertyValue>) {
        self.entity_mut(kind, id).properties.insert(name.to_string(), value.into());
    }

    pub fn remove_property(&mut self, kind: EntityKind, id: u64, name: &str) {
        self.entity_mut(kind, id).properties.remove(name);
    }

    pub fn add_label(&mut self, id: u64, label: &str) {
        self.entity_mut(EntityKind::Node, id).labels.insert(label.to_string());
    }

    pub fn remove_label(&mut self, id: u64, label: &str) {
        self.entity_mut(EntityKind::Node, id).labels.remove(label);
    }

    pub fn delete_relationship(&mut self, id: u64) {
        self.touch(EntityKind::Relationship, id);
        self.working.relationships.remove(&id);
    }

    /// Delete a node together with its relationships.
    pub fn detach_delete_node(&mut self, id: u64) {
        let attached: Vec<u64> = self
            .working
            .relationships
            .iter()
            .filter(|(_, r)| r.start == id || r.end == id)
            .map(|(rid, _)| *rid)
            .collect();
        for rid in attached {
            self.delete_relationship(rid);
        }
        self.touch(EntityKind::Node, id);
        self.working.nodes.remove(&id);
    }

    /// Ids of the nodes carrying `label` as seen inside this transaction.
    pub fn find_nodes(&self, label: &str) -> Vec<u64> {
        self.working
            .nodes
            .iter()
            .filter(|(_, n)| n.labels.contains(label))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn find_nodes_by(&self, name: &str, value: impl Into<PropertyValue>) -> Vec<u64> {
        let value = value.into();
        self.working
            .nodes
            .iter()
            .filter(|(_, n)| n.property(name) == Some(&value))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn relationships_of(&self, node: u64) -> Vec<u64> {
        self.working
            .relationships
            .iter()
            .filter(|(_, r)| r.start == node || r.end == node)
            .map(|(id, _)| *id)
            .collect()
    }

    fn diffs(&self) -> Vec<EntityDiff> {
        self.order
            .iter()
            .filter_map(|&(kind, id)| {
                let before = self.before.get(&(kind, id)).cloned().flatten();
                let after = self.working.snapshot(kind, id);
                match (before, after) {
                    (None, None) => None,
                    (None, Some(after)) => Some(EntityDiff::created(kind, id, after)),
                    (Some(before), None) => Some(EntityDiff::deleted(kind, id, before)),
                    (Some(before), Some(after)) if before == after => None,
                    (Some(before), Some(after)) => Some(EntityDiff::modified(kind, id, before, after)),
                }
            })
            .collect()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.success {
            return;
        }
        let diffs = self.diffs();
        let mut state = self.graph.state.lock().unwrap();
        *state = std::mem::take(&mut self.working);
        // Publish under the lock so commit order and sequence order agree
        self.graph.feed.publish(diffs);
    }
}
