// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit-event model shared with the host graph database.
//!
//! The host delivers one [`TransactionData`] per committed transaction. Each
//! touched entity carries a snapshot of its labels and properties from before
//! and after the transaction, so the replicator never needs to read the graph
//! back while processing a commit.
//!
//! ```text
//! host commit ──▶ CommitFeed::publish() ──▶ CommitSubscription (per engine)
//!                  (assigns sequence)         (unbounded, commit order)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;

/// Kind of graph entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Relationship,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::Node => write!(f, "node"),
            EntityKind::Relationship => write!(f, "relationship"),
        }
    }
}

/// A property value as stored on a node or relationship.
///
/// Lists are ordered. The graph only stores lists of scalars; anything else
/// that reaches the document builder is rejected there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value is a list.
    pub fn is_list(&self) -> bool {
        matches!(self, PropertyValue::List(_))
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl<T: Into<PropertyValue>> From<Vec<T>> for PropertyValue {
    fn from(values: Vec<T>) -> Self {
        PropertyValue::List(values.into_iter().map(Into::into).collect())
    }
}

/// Labels and properties of an entity at one point in time.
///
/// For relationships, `labels` holds the single relationship type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub labels: BTreeSet<String>,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl EntitySnapshot {
    /// Create a snapshot from labels and properties.
    pub fn new<L, P, K, V>(labels: L, properties: P) -> Self
    where
        L: IntoIterator,
        L::Item: Into<String>,
        P: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<PropertyValue>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            properties: properties
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Get a property by name.
    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }
}

/// Change to a single entity within one transaction.
///
/// - `before = None` - the entity was created in this transaction
/// - `after = None` - the entity was deleted in this transaction
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDiff {
    pub kind: EntityKind,
    /// Graph-native id.
    pub id: u64,
    pub before: Option<EntitySnapshot>,
    pub after: Option<EntitySnapshot>,
}

impl EntityDiff {
    /// A newly created entity.
    pub fn created(kind: EntityKind, id: u64, after: EntitySnapshot) -> Self {
        Self { kind, id, before: None, after: Some(after) }
    }

    /// A modified entity.
    pub fn modified(kind: EntityKind, id: u64, before: EntitySnapshot, after: EntitySnapshot) -> Self {
        Self { kind, id, before: Some(before), after: Some(after) }
    }

    /// A deleted entity.
    pub fn deleted(kind: EntityKind, id: u64, before: EntitySnapshot) -> Self {
        Self { kind, id, before: Some(before), after: None }
    }

    /// Identifier used in logs (`node:42`).
    pub fn entity_ref(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

/// Everything one committed transaction changed, in the order the entities
/// were first touched.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionData {
    /// Commit sequence number, strictly increasing per database.
    pub sequence: u64,
    pub diffs: Vec<EntityDiff>,
}

impl TransactionData {
    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// Source of committed transactions (implemented by the host).
///
/// The engine subscribes on start and drops the subscription on stop.
pub trait CommitSource: Send + Sync + 'static {
    /// Register a new subscriber. Commits published after this call are
    /// delivered to it in commit order.
    fn subscribe(&self) -> CommitSubscription;
}

/// Receiving end of a commit subscription.
pub struct CommitSubscription {
    rx: mpsc::UnboundedReceiver<Arc<TransactionData>>,
}

impl CommitSubscription {
    /// Wrap a receiver created by a custom [`CommitSource`].
    pub fn new(rx: mpsc::UnboundedReceiver<Arc<TransactionData>>) -> Self {
        Self { rx }
    }

    /// Receive the next commit. Returns `None` once the source is gone or the
    /// subscription was closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<TransactionData>> {
        self.rx.recv().await
    }

    /// Stop accepting new commits. Commits already delivered can still be
    /// drained with [`recv()`](Self::recv).
    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Host-side publisher that fans commits out to every live subscription.
///
/// Cheap to share; hosts keep one per database and call
/// [`publish()`](Self::publish) after each successful commit.
#[derive(Default)]
pub struct CommitFeed {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<TransactionData>>>>,
    sequence: AtomicU64,
}

impl CommitFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a committed transaction. Returns the sequence number assigned.
    ///
    /// Empty transactions still consume a sequence number but are not
    /// delivered.
    pub fn publish(&self, diffs: Vec<EntityDiff>) -> u64 {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        if diffs.is_empty() {
            return sequence;
        }

        let tx = Arc::new(TransactionData { sequence, diffs });
        subscribers.retain(|sub| sub.send(Arc::clone(&tx)).is_ok());
        debug!(sequence, subscribers = subscribers.len(), "Published commit");
        sequence
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| !sub.is_closed());
        subscribers.len()
    }

    /// Last sequence number handed out.
    pub fn last_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl CommitSource for CommitFeed {
    fn subscribe(&self) -> CommitSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        CommitSubscription::new(rx)
    }
}

impl<T: CommitSource> CommitSource for Arc<T> {
    fn subscribe(&self) -> CommitSubscription {
        (**self).subscribe()
    }
}
