// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync writer: collapses a batch of document operations and sends it to the
//! search index in bulk, retrying what failed.
//!
//! # Design
//!
//! ```text
//! SyncBatch ──▶ collapse ──▶ chunks of bulk_size ──▶ [rate limit] ──▶ circuit ──▶ bulk_write
//!              (last op per                                                         │
//!               index/type/id wins)             ◀── retry retryable subset ◀────────┘
//!                                                   (backoff, max_attempts)
//! ```
//!
//! Per-document outcomes:
//! - `Ok` → written
//! - `NotFound` on a delete → written (deletes are idempotent)
//! - retryable failure → retried with the rest of the failed subset
//! - permanent failure → reported immediately
//!
//! A transport error (or an open circuit, or a request timeout) retries the
//! whole chunk. Nothing is dropped silently: whatever is still failing when
//! attempts run out ends up in [`DispatchReport::failed`].

use crate::circuit_breaker::{CircuitError, IndexCircuit};
use crate::config::WriterConfig;
use crate::document::{DocKey, IndexDocument};
use crate::error::ReplicationError;
use crate::index::{BulkItemOutcome, IndexError, SearchIndex};
use crate::metrics;
use crate::resilience::{RateLimiter, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument, warn};

/// Ordered document operations of one commit (or one lane's share of it).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncBatch {
    docs: Vec<IndexDocument>,
}

impl SyncBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc: IndexDocument) {
        self.docs.push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn docs(&self) -> &[IndexDocument] {
        &self.docs
    }

    /// Keep only the last operation per `(index, type, id)`, ordered by the
    /// position of that last operation.
    pub fn collapse(self) -> Vec<IndexDocument> {
        collapse(self.docs)
    }
}

impl From<Vec<IndexDocument>> for SyncBatch {
    fn from(docs: Vec<IndexDocument>) -> Self {
        Self { docs }
    }
}

impl Extend<IndexDocument> for SyncBatch {
    fn extend<T: IntoIterator<Item = IndexDocument>>(&mut self, iter: T) {
        self.docs.extend(iter);
    }
}

/// Later write wins. A delete after an upsert leaves only the delete.
pub fn collapse(docs: Vec<IndexDocument>) -> Vec<IndexDocument> {
    let mut last: HashMap<DocKey, usize> = HashMap::with_capacity(docs.len());
    for (i, doc) in docs.iter().enumerate() {
        last.insert(doc.key.clone(), i);
    }
    docs.into_iter()
        .enumerate()
        .filter(|(i, doc)| last.get(&doc.key) == Some(i))
        .map(|(_, doc)| doc)
        .collect()
}

/// A document the writer gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedDocument {
    pub doc: IndexDocument,
    pub reason: String,
    /// Whether the last failure was transient. Only these are worth a
    /// retry pass.
    pub retryable: bool,
}

/// Result of dispatching one batch.
#[derive(Debug, Default, Clone)]
pub struct DispatchReport {
    /// Operations submitted (after collapse).
    pub total: usize,
    /// Operations superseded by a later one in the same batch.
    pub collapsed: usize,
    /// Operations the index acknowledged.
    pub written: usize,
    /// Deletes of documents that did not exist (counted in `written`).
    pub not_found: usize,
    /// Bulk requests sent, including retries.
    pub requests: usize,
    /// Highest attempt number any chunk needed.
    pub attempts: usize,
    pub failed: Vec<FailedDocument>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Summarize failures as an error, if any.
    pub fn to_error(&self) -> Option<ReplicationError> {
        if self.failed.is_empty() {
            None
        } else {
            Some(ReplicationError::DispatchExhausted {
                attempts: self.attempts,
                failed: self.failed.len(),
            })
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: DispatchReport) {
        self.total += other.total;
        self.collapsed += other.collapsed;
        self.written += other.written;
        self.not_found += other.not_found;
        self.requests += other.requests;
        self.attempts = self.attempts.max(other.attempts);
        self.failed.extend(other.failed);
    }
}

/// Sends batches to a [`SearchIndex`].
pub struct SyncWriter<I: SearchIndex> {
    index: Arc<I>,
    retry: RetryConfig,
    bulk_size: usize,
    circuit: Arc<IndexCircuit>,
    limiter: Option<Arc<RateLimiter>>,
    module_id: String,
}

impl<I: SearchIndex> SyncWriter<I> {
    pub fn new(
        index: Arc<I>,
        config: &WriterConfig,
        circuit: Arc<IndexCircuit>,
        module_id: impl Into<String>,
    ) -> Self {
        Self {
            index,
            retry: config.retry_config(),
            bulk_size: config.bulk_size.max(1),
            circuit,
            limiter: config
                .rate_limit_config()
                .map(|rate| Arc::new(RateLimiter::new(rate))),
            module_id: module_id.into(),
        }
    }

    /// Override the backoff policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    pub fn circuit(&self) -> &Arc<IndexCircuit> {
        &self.circuit
    }

    /// Collapse and write a batch.
    #[instrument(skip_all, fields(module = %self.module_id, docs = batch.len()))]
    pub async fn dispatch(&self, batch: SyncBatch) -> DispatchReport {
        let before = batch.len();
        let docs = batch.collapse();
        metrics::record_batch_collapse(&self.module_id, before, docs.len());

        let mut report = DispatchReport {
            total: docs.len(),
            collapsed: before - docs.len(),
            ..Default::default()
        };
        if docs.is_empty() {
            return report;
        }

        let mut docs = docs.into_iter().peekable();
        while docs.peek().is_some() {
            let chunk: Vec<IndexDocument> = docs.by_ref().take(self.bulk_size).collect();
            self.dispatch_chunk(chunk, &mut report).await;
        }

        if report.is_success() {
            debug!(total = report.total, written = report.written, "Batch dispatched");
        } else {
            warn!(
                total = report.total,
                written = report.written,
                failed = report.failed.len(),
                attempts = report.attempts,
                "Batch dispatched with failures"
            );
        }
        report
    }

    async fn dispatch_chunk(&self, chunk: Vec<IndexDocument>, report: &mut DispatchReport) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut pending = chunk;
        let mut attempt = 1;

        loop {
            report.requests += 1;
            report.attempts = report.attempts.max(attempt);

            // (doc, reason) still failing retryably after this attempt
            let mut retry: Vec<(IndexDocument, String)> = Vec::new();

            match self.send(&pending).await {
                Ok(outcomes) => {
                    for (doc, outcome) in pending.into_iter().zip(outcomes) {
                        match outcome {
                            BulkItemOutcome::Ok => report.written += 1,
                            BulkItemOutcome::NotFound if doc.deleted => {
                                report.written += 1;
                                report.not_found += 1;
                            }
                            BulkItemOutcome::NotFound => {
                                report.failed.push(FailedDocument {
                                    doc,
                                    reason: "document not found".to_string(),
                                    retryable: false,
                                });
                            }
                            BulkItemOutcome::Failed { retryable: true, reason } => {
                                retry.push((doc, reason));
                            }
                            BulkItemOutcome::Failed { retryable: false, reason } => {
                                warn!(key = %doc.key, reason = %reason, "Document rejected by index");
                                report.failed.push(FailedDocument { doc, reason, retryable: false });
                            }
                        }
                    }
                }
                Err(e) => {
                    let error = ReplicationError::from(e);
                    metrics::record_error(&self.module_id, error.kind());
                    let reason = error.to_string();
                    debug!(attempt, docs = pending.len(), error = %reason, "Bulk request failed");
                    retry = pending.into_iter().map(|doc| (doc, reason.clone())).collect();
                }
            }

            if retry.is_empty() {
                return;
            }

            if attempt >= max_attempts {
                warn!(
                    attempts = attempt,
                    failed = retry.len(),
                    "Retries exhausted, documents not written"
                );
                report.failed.extend(retry.into_iter().map(|(doc, reason)| FailedDocument {
                    doc,
                    reason,
                    retryable: true,
                }));
                return;
            }

            let delay = self.retry.delay_for_attempt(attempt);
            attempt += 1;
            metrics::record_bulk_retry(&self.module_id, attempt, retry.len());
            debug!(attempt, docs = retry.len(), delay_ms = delay.as_millis() as u64, "Retrying failed documents");
            tokio::time::sleep(delay).await;
            pending = retry.into_iter().map(|(doc, _)| doc).collect();
        }
    }

    /// One bulk request through the rate limiter, circuit breaker and timeout.
    async fn send(&self, docs: &[IndexDocument]) -> Result<Vec<BulkItemOutcome>, IndexError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire_documents(docs.len()).await;
        }

        let start = Instant::now();
        let payload = docs.to_vec();
        let timeout = self.retry.request_timeout;
        let result = self
            .circuit
            .bulk
            .call(|| async move {
                match tokio::time::timeout(timeout, self.index.bulk_write(payload)).await {
                    Ok(result) => result,
                    Err(_) => Err(IndexError::new(format!(
                        "bulk request timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            })
            .await;

        let result = match result {
            Ok(outcomes) if outcomes.len() == docs.len() => Ok(outcomes),
            Ok(outcomes) => Err(IndexError::new(format!(
                "bulk response has {} items for {} documents",
                outcomes.len(),
                docs.len()
            ))),
            Err(CircuitError::Rejected) => Err(IndexError::new("circuit breaker open")),
            Err(CircuitError::Inner(e)) => Err(e),
        };

        metrics::record_bulk_request(&self.module_id, docs.len(), result.is_ok(), start.elapsed());
        result
    }
}
