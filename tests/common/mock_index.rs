//! Mock SearchIndex for testing.
//!
//! Wraps an [`InMemoryIndex`] and records every bulk call. Configurable
//! failures simulate an unavailable, overloaded or rejecting index.

#![allow(dead_code)]

use graph_index_replicator::index::{BoxFuture, BulkItemOutcome, IndexError, InMemoryIndex, SearchIndex};
use graph_index_replicator::{DocKey, IndexDocument};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// How a failing bulk call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// The whole request fails (connection refused, 503, ...).
    Transport,
    /// Every item fails with a retryable error (429, rejected execution).
    RetryableItems,
    /// Every item is rejected for good (mapping conflict, 400).
    PermanentItems,
    /// The request hangs for this long before succeeding.
    Slow(Duration),
}

/// Recording, optionally failing search index.
///
/// # Example
/// ```rust,ignore
/// let index = MockIndex::failing(FailureMode::Transport, 2);
/// // first two bulk calls fail, then writes go through
/// ```
pub struct MockIndex {
    inner: InMemoryIndex,
    mode: FailureMode,
    /// Remaining failing calls
    failures_left: AtomicUsize,
    /// Fail every call while set, regardless of `failures_left`
    down: AtomicBool,
    calls: Mutex<Vec<Vec<IndexDocument>>>,
}

impl Default for MockIndex {
    fn default() -> Self {
        Self::failing(FailureMode::Transport, 0)
    }
}

impl MockIndex {
    /// An index that never fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` bulk calls.
    pub fn failing(mode: FailureMode, times: usize) -> Self {
        Self {
            inner: InMemoryIndex::new(),
            mode,
            failures_left: AtomicUsize::new(times),
            down: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every bulk call until [`set_down(false)`](Self::set_down).
    pub fn always_failing(mode: FailureMode) -> Self {
        let index = Self::failing(mode, 0);
        index.set_down(true);
        index
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Stored documents.
    pub fn inner(&self) -> &InMemoryIndex {
        &self.inner
    }

    /// Every bulk call received, in order.
    pub fn calls(&self) -> Vec<Vec<IndexDocument>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Total documents received across calls.
    pub fn documents_received(&self) -> usize {
        self.calls.lock().unwrap().iter().map(Vec::len).sum()
    }

    fn should_fail(&self) -> bool {
        if self.down.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl SearchIndex for MockIndex {
    fn bulk_write(&self, docs: Vec<IndexDocument>) -> BoxFuture<'_, Vec<BulkItemOutcome>> {
        self.calls.lock().unwrap().push(docs.clone());
        let fail = self.should_fail();

        Box::pin(async move {
            if fail {
                match self.mode {
                    FailureMode::Transport => return Err(IndexError::new("connection refused")),
                    FailureMode::RetryableItems => {
                        return Ok(docs
                            .iter()
                            .map(|_| BulkItemOutcome::retryable("es_rejected_execution_exception"))
                            .collect())
                    }
                    FailureMode::PermanentItems => {
                        return Ok(docs
                            .iter()
                            .map(|_| BulkItemOutcome::permanent("mapper_parsing_exception"))
                            .collect())
                    }
                    FailureMode::Slow(delay) => tokio::time::sleep(delay).await,
                }
            }
            self.inner.bulk_write(docs).await
        })
    }

    fn get(&self, key: &DocKey) -> BoxFuture<'_, Option<Map<String, Value>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &DocKey) -> BoxFuture<'_, bool> {
        self.inner.delete(key)
    }
}
