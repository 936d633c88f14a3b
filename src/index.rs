// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search index integration traits.
//!
//! The host injects a [`SearchIndex`] implementation at construction. Bulk
//! writes report one outcome per document so the writer can retry only what
//! failed.
//!
//! # Example
//!
//! ```rust,no_run
//! use graph_index_replicator::index::{BoxFuture, BulkItemOutcome, SearchIndex};
//! use graph_index_replicator::{DocKey, IndexDocument};
//! use serde_json::{Map, Value};
//!
//! struct MyIndex { /* http client ... */ }
//!
//! impl SearchIndex for MyIndex {
//!     fn bulk_write(&self, docs: Vec<IndexDocument>) -> BoxFuture<'_, Vec<BulkItemOutcome>> {
//!         Box::pin(async move { Ok(docs.iter().map(|_| BulkItemOutcome::Ok).collect()) })
//!     }
//!
//!     fn get(&self, _key: &DocKey) -> BoxFuture<'_, Option<Map<String, Value>>> {
//!         Box::pin(async move { Ok(None) })
//!     }
//!
//!     fn delete(&self, _key: &DocKey) -> BoxFuture<'_, bool> {
//!         Box::pin(async move { Ok(false) })
//!     }
//! }
//! ```

use crate::document::{DocKey, IndexDocument};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result type for search index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = IndexResult<T>> + Send + 'a>>;

/// Transport-level failure talking to the index. The whole call failed and
/// may be retried.
#[derive(Debug, Clone)]
pub struct IndexError(pub String);

impl IndexError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IndexError {}

/// Outcome of one document in a bulk write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkItemOutcome {
    /// Written (or deleted).
    Ok,
    /// The document did not exist. A success for deletes.
    NotFound,
    /// The document was rejected.
    Failed { retryable: bool, reason: String },
}

impl BulkItemOutcome {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Failed { retryable: true, reason: reason.into() }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Failed { retryable: false, reason: reason.into() }
    }
}

/// What the replicator needs from a search index.
pub trait SearchIndex: Send + Sync + 'static {
    /// Write a batch of upserts and deletes.
    ///
    /// Returns one outcome per input document, in input order. An `Err`
    /// means the request as a whole failed and nothing is known about the
    /// individual documents.
    fn bulk_write(&self, docs: Vec<IndexDocument>) -> BoxFuture<'_, Vec<BulkItemOutcome>>;

    /// Fetch a document's fields, `None` if it does not exist.
    fn get(&self, key: &DocKey) -> BoxFuture<'_, Option<Map<String, Value>>>;

    /// Delete a single document. Returns whether it existed.
    fn delete(&self, key: &DocKey) -> BoxFuture<'_, bool>;
}

impl<T: SearchIndex> SearchIndex for Arc<T> {
    fn bulk_write(&self, docs: Vec<IndexDocument>) -> BoxFuture<'_, Vec<BulkItemOutcome>> {
        (**self).bulk_write(docs)
    }

    fn get(&self, key: &DocKey) -> BoxFuture<'_, Option<Map<String, Value>>> {
        (**self).get(key)
    }

    fn delete(&self, key: &DocKey) -> BoxFuture<'_, bool> {
        (**self).delete(key)
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    fields: Map<String, Value>,
    sequence: u64,
}

/// Commits a delete is remembered for by default.
pub const DEFAULT_TOMBSTONE_HORIZON: u64 = 10_000;

/// In-process index for standalone mode and tests.
///
/// Writes carrying an older commit sequence than what is stored for the same
/// key (including a delete) are acknowledged and ignored. Deletes are
/// remembered until they fall `tombstone_horizon` commits behind the newest
/// sequence seen; a write older than that is no longer recognised as stale.
#[derive(Debug)]
pub struct InMemoryIndex {
    docs: RwLock<HashMap<DocKey, StoredDocument>>,
    /// Sequence of the last delete per key.
    tombstones: RwLock<HashMap<DocKey, u64>>,
    tombstone_horizon: u64,
    newest_sequence: AtomicU64,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::with_tombstone_horizon(DEFAULT_TOMBSTONE_HORIZON)
    }
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tombstone_horizon(horizon: u64) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            tombstone_horizon: horizon,
            newest_sequence: AtomicU64::new(0),
        }
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    /// Ids stored under an index/type, sorted.
    pub async fn ids(&self, index: &str, doc_type: &str) -> Vec<String> {
        let docs = self.docs.read().await;
        let mut ids: Vec<String> = docs
            .keys()
            .filter(|k| k.index == index && k.doc_type == doc_type)
            .map(|k| k.id.clone())
            .collect();
        ids.sort();
        ids
    }

    async fn apply(&self, doc: IndexDocument) -> BulkItemOutcome {
        let mut docs = self.docs.write().await;
        let mut tombstones = self.tombstones.write().await;

        let newest = docs
            .get(&doc.key)
            .map(|d| d.sequence)
            .into_iter()
            .chain(tombstones.get(&doc.key).copied())
            .max();
        if newest.is_some_and(|seq| seq > doc.sequence) {
            tracing::trace!(key = %doc.key, sequence = doc.sequence, "Ignoring stale write");
            return BulkItemOutcome::Ok;
        }

        let high_water = self.newest_sequence.fetch_max(doc.sequence, Ordering::Relaxed).max(doc.sequence);

        if doc.deleted {
            tombstones.insert(doc.key.clone(), doc.sequence);
            let horizon = self.tombstone_horizon;
            tombstones.retain(|_, seq| seq.saturating_add(horizon) >= high_water);
            match docs.remove(&doc.key) {
                Some(_) => BulkItemOutcome::Ok,
                None => BulkItemOutcome::NotFound,
            }
        } else {
            tombstones.remove(&doc.key);
            docs.insert(
                doc.key,
                StoredDocument { fields: doc.fields, sequence: doc.sequence },
            );
            BulkItemOutcome::Ok
        }
    }
}

impl SearchIndex for InMemoryIndex {
    fn bulk_write(&self, docs: Vec<IndexDocument>) -> BoxFuture<'_, Vec<BulkItemOutcome>> {
        Box::pin(async move {
            let mut outcomes = Vec::with_capacity(docs.len());
            for doc in docs {
                outcomes.push(self.apply(doc).await);
            }
            Ok(outcomes)
        })
    }

    fn get(&self, key: &DocKey) -> BoxFuture<'_, Option<Map<String, Value>>> {
        let key = key.clone();
        Box::pin(async move { Ok(self.docs.read().await.get(&key).map(|d| d.fields.clone())) })
    }

    fn delete(&self, key: &DocKey) -> BoxFuture<'_, bool> {
        let key = key.clone();
        Box::pin(async move { Ok(self.docs.write().await.remove(&key).is_some()) })
    }
}
