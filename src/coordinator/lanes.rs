// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dispatch lanes: one writer task per lane, keys partitioned by hash.
//!
//! Every `(index, type, id)` always maps to the same lane, so operations for
//! one document are written in commit order while independent documents are
//! written concurrently.
//!
//! # Retry Pass
//!
//! When enabled, documents that still fail after the writer's retries are
//! parked on their lane and retried on every `interval` tick:
//!
//! ```text
//! dispatch ──failed (retryable)──▶ park ──tick──▶ retry pass ──ok──▶ recovered
//!    ▲                               │                 │
//!    │ newer op for same key         │ full            │ max_passes reached
//!    └──── discards parked doc ──────┴──▶ abandoned ◀──┘
//! ```
//!
//! Permanent failures are abandoned right away; parking them would only
//! repeat the rejection. With the retry pass disabled every failure is
//! abandoned and reported.
//!
//! # Graceful Shutdown
//!
//! A lane runs until its channel closes, i.e. the pipeline dropped its
//! sender after draining. Queued batches are dispatched first. Documents
//! still parked at that point are abandoned and reported.

use super::types::{EngineStats, LaneGauges};
use crate::config::{RetryPassConfig, SloConfig};
use crate::document::{DocKey, IndexDocument};
use crate::index::SearchIndex;
use crate::metrics;
use crate::writer::{FailedDocument, SyncBatch, SyncWriter};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Lane owning `key`.
pub(crate) fn lane_for(key: &DocKey, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

/// Split a commit's documents into per-lane batches, keeping order within
/// each lane.
pub(crate) fn partition(docs: Vec<IndexDocument>, lanes: usize) -> Vec<SyncBatch> {
    let mut batches: Vec<SyncBatch> = (0..lanes.max(1)).map(|_| SyncBatch::new()).collect();
    for doc in docs {
        let lane = lane_for(&doc.key, batches.len());
        batches[lane].push(doc);
    }
    batches
}

struct Parked {
    doc: IndexDocument,
    passes: u32,
    reason: String,
}

/// Parked documents of one lane, latest per key.
struct ParkingLot {
    docs: HashMap<DocKey, Parked>,
    capacity: usize,
    max_passes: u32,
}

impl ParkingLot {
    fn new(config: &RetryPassConfig) -> Self {
        Self {
            docs: HashMap::new(),
            capacity: config.max_parked_per_lane,
            max_passes: config.max_passes,
        }
    }

    fn len(&self) -> usize {
        self.docs.len()
    }

    fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Drop parked documents superseded by a newer dispatch.
    fn supersede(&mut self, batch: &SyncBatch) -> usize {
        if self.docs.is_empty() {
            return 0;
        }
        batch
            .docs()
            .iter()
            .filter(|doc| self.docs.remove(&doc.key).is_some())
            .count()
    }

    /// Park a failed document. Returns it back if the lot is full.
    fn park(&mut self, failed: FailedDocument, passes: u32) -> Option<FailedDocument> {
        if self.docs.len() >= self.capacity && !self.docs.contains_key(&failed.doc.key) {
            return Some(failed);
        }
        self.docs.insert(
            failed.doc.key.clone(),
            Parked {
                doc: failed.doc,
                passes,
                reason: failed.reason,
            },
        );
        None
    }

    /// Take everything out, oldest operation first.
    fn take(&mut self) -> Vec<Parked> {
        let mut parked: Vec<Parked> = self.docs.drain().map(|(_, p)| p).collect();
        parked.sort_by_key(|p| p.doc.sequence);
        parked
    }
}

/// Everything one lane task needs.
pub(crate) struct Lane<I: SearchIndex> {
    pub id: usize,
    pub module_id: String,
    pub writer: Arc<SyncWriter<I>>,
    pub retry_pass: RetryPassConfig,
    pub slo: SloConfig,
    pub stats: Arc<EngineStats>,
    pub gauges: Arc<LaneGauges>,
}

impl<I: SearchIndex> Lane<I> {
    /// Run until the channel closes and the queue is drained.
    pub(crate) async fn run(self, mut rx: mpsc::Receiver<SyncBatch>) {
        let span = info_span!("lane", module = %self.module_id, lane = self.id);

        async move {
            debug!("Dispatch lane started");

            let mut lot = ParkingLot::new(&self.retry_pass);
            let mut timer = tokio::time::interval(self.retry_pass.interval());
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            timer.reset();

            loop {
                tokio::select! {
                    biased;

                    batch = rx.recv() => {
                        let Some(batch) = batch else {
                            break;
                        };
                        let taken = batch.len();
                        let before = self
                            .gauges
                            .queued
                            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| Some(q.saturating_sub(taken)))
                            .unwrap_or(0);
                        metrics::set_lane_depth(&self.module_id, self.id, before.saturating_sub(taken));

                        let superseded = lot.supersede(&batch);
                        if superseded > 0 {
                            debug!(superseded, "Parked documents superseded by newer operations");
                        }
                        self.dispatch(batch, &mut lot).await;
                        self.update_parked(&lot);
                    }

                    _ = timer.tick(), if self.retry_pass.enabled && !lot.is_empty() => {
                        self.retry_pass(&mut lot).await;
                        self.update_parked(&lot);
                    }
                }
            }

            if !lot.is_empty() {
                let remaining: Vec<FailedDocument> = lot
                    .take()
                    .into_iter()
                    .map(|p| FailedDocument { doc: p.doc, reason: p.reason, retryable: true })
                    .collect();
                self.abandon(remaining, "shutdown");
                self.update_parked(&lot);
            }

            info!("Dispatch lane stopped");
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, batch: SyncBatch, lot: &mut ParkingLot) {
        let start = Instant::now();
        let report = self.writer.dispatch(batch).await;
        let elapsed = start.elapsed();

        metrics::record_bulk_write(
            &self.module_id,
            self.id,
            report.total,
            report.written,
            report.failed_count(),
            elapsed,
        );
        if self.slo.is_dispatch_violation(elapsed) {
            warn!(
                latency_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slo.max_dispatch_latency_ms,
                docs = report.total,
                "Dispatch latency SLO violated"
            );
            metrics::record_slo_violation(&self.module_id, "dispatch", elapsed.as_millis() as u64);
        }

        EngineStats::add(&self.stats.documents_written, report.written);
        if report.is_success() {
            return;
        }
        EngineStats::add(&self.stats.documents_failed, report.failed_count());

        let (retryable, permanent): (Vec<_>, Vec<_>) =
            report.failed.into_iter().partition(|f| f.retryable);
        self.abandon(permanent, "rejected");

        if !self.retry_pass.enabled {
            self.abandon(retryable, "exhausted");
            return;
        }

        let overflow: Vec<FailedDocument> = retryable
            .into_iter()
            .filter_map(|failed| lot.park(failed, 0))
            .collect();
        self.abandon(overflow, "park_full");
    }

    async fn retry_pass(&self, lot: &mut ParkingLot) {
        let parked = lot.take();
        let retried = parked.len();
        let mut passes: HashMap<DocKey, u32> = HashMap::with_capacity(retried);
        let mut batch = SyncBatch::new();
        for p in parked {
            passes.insert(p.doc.key.clone(), p.passes + 1);
            batch.push(p.doc);
        }

        let report = self.writer.dispatch(batch).await;
        let recovered = report.written;
        EngineStats::add(&self.stats.documents_recovered, recovered);
        metrics::record_retry_pass(&self.module_id, self.id, retried, recovered);

        let mut given_up = Vec::new();
        for failed in report.failed {
            let passes = passes.get(&failed.doc.key).copied().unwrap_or(self.retry_pass.max_passes);
            if !failed.retryable || passes >= lot.max_passes {
                given_up.push(failed);
            } else if let Some(overflow) = lot.park(failed, passes) {
                given_up.push(overflow);
            }
        }

        info!(retried, recovered, still_parked = lot.len(), "Retry pass complete");
        self.abandon(given_up, "max_passes");
    }

    fn abandon(&self, docs: Vec<FailedDocument>, reason: &str) {
        if docs.is_empty() {
            return;
        }
        for failed in &docs {
            warn!(
                key = %failed.doc.key,
                deleted = failed.doc.deleted,
                sequence = failed.doc.sequence,
                error = %failed.reason,
                reason,
                "Document abandoned, index may be stale"
            );
        }
        EngineStats::add(&self.stats.documents_abandoned, docs.len());
        metrics::record_abandoned(&self.module_id, reason, docs.len());
    }

    fn update_parked(&self, lot: &ParkingLot) {
        self.gauges.parked.store(lot.len(), Ordering::Relaxed);
        metrics::set_parked(&self.module_id, self.id, lot.len());
    }
}
