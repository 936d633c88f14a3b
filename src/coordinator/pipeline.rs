// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Commit pipeline: extract → resolve → build, then hand off to the lanes.
//!
//! One task per engine consumes the commit subscription in commit order:
//! 1. Extracts entity changes (coalesced per entity)
//! 2. Resolves the mapping rules for the labels before and after the commit
//! 3. Builds index documents (upserts and deletes)
//! 4. Routes them to dispatch lanes by `(index, type, id)` hash
//!
//! A malformed change is logged, counted and skipped; the rest of the commit
//! continues. A property value the index cannot hold skips only the upserts
//! that project it; deletes for lost destinations still go out. Nothing here can fail the originating graph transaction.
//!
//! # Graceful Shutdown
//!
//! On the shutdown signal the subscription is closed so no new commits are
//! accepted, commits already delivered are drained, and the lane senders are
//! dropped so the lanes finish their queues and exit.

use super::lanes::partition;
use super::types::{EngineStats, LaneGauges};
use crate::document::{DocumentBuilder, IndexDocument};
use crate::error::ReplicationError;
use crate::extract::ChangeExtractor;
use crate::graph::{CommitSubscription, TransactionData};
use crate::mapping::Mapping;
use crate::metrics;
use crate::writer::SyncBatch;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

/// Sender side of one dispatch lane.
pub(crate) struct LaneSender {
    pub tx: mpsc::Sender<SyncBatch>,
    pub gauges: Arc<LaneGauges>,
}

/// Turns commits into index documents.
pub struct CommitPipeline {
    mapping: Arc<dyn Mapping>,
    extractor: ChangeExtractor,
    builder: DocumentBuilder,
    module_id: String,
    stats: Arc<EngineStats>,
}

impl CommitPipeline {
    pub fn new(mapping: Arc<dyn Mapping>, module_id: impl Into<String>, stats: Arc<EngineStats>) -> Self {
        Self {
            extractor: ChangeExtractor::new(Arc::clone(&mapping)),
            builder: DocumentBuilder::new(),
            mapping,
            module_id: module_id.into(),
            stats,
        }
    }

    /// Build the document operations for one commit, in change order.
    #[instrument(skip_all, fields(module = %self.module_id, tx = tx.sequence))]
    pub fn process(&self, tx: &TransactionData) -> Vec<IndexDocument> {
        let start = Instant::now();
        let mut docs = Vec::new();
        let mut changes = 0;
        let mut by_operation: BTreeMap<&'static str, usize> = BTreeMap::new();

        for result in self.extractor.extract(tx) {
            let change = match result {
                Ok(change) => change,
                Err(e) => {
                    self.skip(&e, &self.stats.extraction_errors);
                    continue;
                }
            };
            changes += 1;
            *by_operation.entry(change.operation.as_str()).or_default() += 1;

            let current = if change.is_delete() {
                Vec::new()
            } else {
                self.mapping.resolve(&change.labels_after, change.kind)
            };
            let previous = self.mapping.resolve(&change.labels_before, change.kind);

            let built = self.builder.build(&change, &current, &previous);
            for e in &built.failures {
                self.skip(e, &self.stats.build_errors);
            }
            docs.extend(built.documents);
        }

        let deletes = docs.iter().filter(|d| d.deleted).count();
        EngineStats::add(&self.stats.commits, 1);
        EngineStats::add(&self.stats.changes, changes);
        EngineStats::add(&self.stats.documents_built, docs.len());

        metrics::record_commit(&self.module_id, changes);
        for (operation, count) in by_operation {
            metrics::record_changes(&self.module_id, operation, count);
        }
        metrics::record_documents_built(&self.module_id, docs.len() - deletes, deletes);
        metrics::record_pipeline_latency(&self.module_id, start.elapsed());

        debug!(changes, upserts = docs.len() - deletes, deletes, "Commit processed");
        docs
    }

    fn skip(&self, error: &ReplicationError, counter: &std::sync::atomic::AtomicU64) {
        warn!(error = %error, kind = error.kind(), "Skipping unreplicable change");
        metrics::record_error(&self.module_id, error.kind());
        EngineStats::add(counter, 1);
    }
}

/// Consume the subscription until shutdown (or until the source goes away).
///
/// Owns the lane senders: when this returns they are dropped, which lets the
/// lanes drain and stop.
pub(crate) async fn run_pipeline(
    pipeline: CommitPipeline,
    mut subscription: CommitSubscription,
    lanes: Vec<LaneSender>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let span = info_span!("pipeline", module = %pipeline.module_id, lanes = lanes.len());

    async move {
        // Mark the current value as seen so changed() only fires on actual changes
        let mut stopping = *shutdown_rx.borrow_and_update();
        info!("Commit pipeline started");

        while !stopping {
            tokio::select! {
                biased;

                result = shutdown_rx.changed() => {
                    stopping = result.is_err() || *shutdown_rx.borrow();
                }

                commit = subscription.recv() => {
                    match commit {
                        Some(tx) => route(&pipeline, &tx, &lanes).await,
                        None => {
                            warn!("Commit source closed, pipeline stopping");
                            return;
                        }
                    }
                }
            }
        }

        // No new commits; finish what was already delivered
        subscription.close();
        let mut drained = 0;
        while let Some(tx) = subscription.recv().await {
            route(&pipeline, &tx, &lanes).await;
            drained += 1;
        }

        info!(drained, "Commit pipeline stopped");
    }
    .instrument(span)
    .await
}

async fn route(pipeline: &CommitPipeline, tx: &TransactionData, lanes: &[LaneSender]) {
    let docs = pipeline.process(tx);
    if docs.is_empty() {
        return;
    }

    for (lane, batch) in partition(docs, lanes.len()).into_iter().enumerate() {
        if batch.is_empty() {
            continue;
        }
        let sender = &lanes[lane];
        let count = batch.len();
        let queued = sender.gauges.queued.fetch_add(count, Ordering::Relaxed) + count;
        metrics::set_lane_depth(&pipeline.module_id, lane, queued);

        // Waits when the lane is full, pushing back on the subscription
        if sender.tx.send(batch).await.is_err() {
            sender.gauges.queued.fetch_sub(count, Ordering::Relaxed);
            warn!(lane, docs = count, tx = tx.sequence, "Dispatch lane closed, documents dropped");
            metrics::record_abandoned(&pipeline.module_id, "lane_closed", count);
            EngineStats::add(&pipeline.stats.documents_abandoned, count);
        }
    }
}
