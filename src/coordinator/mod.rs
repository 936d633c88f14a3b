// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine coordinator.
//!
//! The orchestrator that ties together:
//! - The host's commit feed via [`crate::graph::CommitSource`]
//! - The commit pipeline (extract → resolve → build)
//! - Dispatch lanes, each driving a [`crate::writer::SyncWriter`]
//! - The index circuit breaker and engine counters
//!
//! # Architecture
//!
//! ```text
//! CommitSource ──subscribe──▶ pipeline task ──hash(index,type,id)──▶ lane 0 ──▶ SearchIndex
//!                            (commit order)                      ├──▶ lane 1 ──▶
//!                                                                 └──▶ lane N ──▶
//! ```
//!
//! The graph transaction has already committed when the pipeline sees it;
//! replication failures are logged, counted and reported, never propagated
//! back to the host.

mod lanes;
mod pipeline;
mod types;

pub use pipeline::CommitPipeline;
pub use types::{EngineState, EngineStats, HealthCheck, LaneHealth, StatsSnapshot};

use crate::circuit_breaker::{CircuitState, IndexCircuit};
use crate::config::ReplicationConfig;
use crate::error::{ReplicationError, Result};
use crate::graph::CommitSource;
use crate::index::SearchIndex;
use crate::mapping::Mapping;
use crate::metrics;
use crate::writer::SyncWriter;
use lanes::Lane;
use pipeline::LaneSender;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use types::LaneGauges;

/// The main replication engine.
///
/// Replicates committed graph changes into a search index. Owns no graph or
/// index state of its own: the host passes in the commit source and the
/// index client.
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> graph_index_replicator::Result<()> {
/// use graph_index_replicator::{CommitFeed, InMemoryIndex, ReplicationConfig, ReplicationEngine};
/// use std::sync::Arc;
///
/// let feed = Arc::new(CommitFeed::new());
/// let index = Arc::new(InMemoryIndex::new());
///
/// let mut engine = ReplicationEngine::from_config(ReplicationConfig::default(), index, feed.clone())?;
/// engine.start().await?;
/// // host calls feed.publish(diffs) after every commit
/// engine.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ReplicationEngine<I: SearchIndex> {
    config: ReplicationConfig,

    /// Compiled decision table, shared read-only
    mapping: Arc<dyn Mapping>,

    index: Arc<I>,

    source: Arc<dyn CommitSource>,

    /// Circuit breaker for index protection, shared by all lanes
    circuit: Arc<IndexCircuit>,

    writer: Arc<SyncWriter<I>>,

    stats: Arc<EngineStats>,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal for the current run
    shutdown_tx: Option<watch::Sender<bool>>,

    /// Per-lane gauges of the current run
    lane_gauges: Vec<Arc<LaneGauges>>,

    pipeline_handle: Option<JoinHandle<()>>,
    lane_handles: Vec<JoinHandle<()>>,
}

impl<I: SearchIndex> ReplicationEngine<I> {
    /// Create an engine with an already-compiled mapping.
    ///
    /// The engine starts `Stopped`. Fails on invalid settings.
    pub fn new(
        config: ReplicationConfig,
        mapping: Arc<dyn Mapping>,
        index: Arc<I>,
        source: Arc<dyn CommitSource>,
    ) -> Result<Self> {
        config.validate()?;

        let settings = &config.settings;
        let circuit = Arc::new(IndexCircuit::with_config(settings.circuit.circuit_config()));
        let writer = Arc::new(SyncWriter::new(
            Arc::clone(&index),
            &settings.writer,
            Arc::clone(&circuit),
            config.module_id.clone(),
        ));
        if let Some(rate) = settings.writer.rate_limit_config() {
            info!(
                rate_per_sec = rate.refill_rate,
                burst = rate.burst_size,
                "Rate limiting enabled for index writes"
            );
        }

        let (state_tx, state_rx) = watch::channel(EngineState::Stopped);
        metrics::set_engine_state(&config.module_id, "Stopped");

        Ok(Self {
            config,
            mapping,
            index,
            source,
            circuit,
            writer,
            stats: Arc::new(EngineStats::default()),
            state_tx,
            state_rx,
            shutdown_tx: None,
            lane_gauges: Vec::new(),
            pipeline_handle: None,
            lane_handles: Vec::new(),
        })
    }

    /// Create an engine, loading the mapping named in the configuration.
    ///
    /// Mapping errors are fatal here, before anything is subscribed.
    pub fn from_config(config: ReplicationConfig, index: Arc<I>, source: Arc<dyn CommitSource>) -> Result<Self> {
        let mapping = config.mapping.load()?;
        info!(
            module_id = %config.module_id,
            strategy = mapping.name(),
            key_property = mapping.key_property(),
            "Mapping loaded"
        );
        Self::new(config, mapping, index, source)
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn module_id(&self) -> &str {
        &self.config.module_id
    }

    pub fn mapping(&self) -> &Arc<dyn Mapping> {
        &self.mapping
    }

    pub fn index(&self) -> &Arc<I> {
        &self.index
    }

    /// Circuit breaker guarding the index.
    pub fn circuit(&self) -> &Arc<IndexCircuit> {
        &self.circuit
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Totals since the engine was created.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Health snapshot for monitoring endpoints. Performs no index I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let lanes: Vec<LaneHealth> = self
            .lane_gauges
            .iter()
            .enumerate()
            .map(|(lane, gauges)| LaneHealth {
                lane,
                queued: gauges.queued.load(Ordering::Relaxed),
                parked: gauges.parked.load(Ordering::Relaxed),
            })
            .collect();
        let circuit = self.circuit.metrics();
        let circuit_open = circuit.state == CircuitState::Open;
        let stats = self.stats.snapshot();

        let ready = state == EngineState::Running && !circuit_open;
        let healthy = ready && stats.documents_abandoned == 0;

        HealthCheck {
            module_id: self.config.module_id.clone(),
            state,
            ready,
            healthy,
            queued_total: lanes.iter().map(|l| l.queued).sum(),
            parked_total: lanes.iter().map(|l| l.parked).sum(),
            lanes,
            circuit,
            circuit_open,
            stats,
        }
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&self.config.module_id, &state.to_string());
    }

    /// Subscribe to the commit feed and start the pipeline and lanes.
    ///
    /// A no-op when already running. A stopped engine can be started again.
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.state(), EngineState::Running | EngineState::Starting) {
            debug!("Start requested while running, ignoring");
            return Ok(());
        }
        // Only reachable when a stop() future was dropped before finishing
        if self.state() == EngineState::Stopping {
            return Err(ReplicationError::InvalidState {
                expected: EngineState::Stopped.to_string(),
                actual: EngineState::Stopping.to_string(),
            });
        }

        let dispatch = &self.config.settings.dispatch;
        info!(
            module_id = %self.config.module_id,
            workers = dispatch.workers,
            retry_pass = self.config.settings.retry_pass.enabled,
            "Starting replication engine"
        );
        self.set_state(EngineState::Starting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(dispatch.workers);
        self.lane_gauges.clear();
        for id in 0..dispatch.workers {
            let (tx, rx) = mpsc::channel(dispatch.lane_capacity);
            let gauges = Arc::new(LaneGauges::default());
            let lane = Lane {
                id,
                module_id: self.config.module_id.clone(),
                writer: Arc::clone(&self.writer),
                retry_pass: self.config.settings.retry_pass.clone(),
                slo: self.config.settings.slo.clone(),
                stats: Arc::clone(&self.stats),
                gauges: Arc::clone(&gauges),
            };
            self.lane_handles.push(tokio::spawn(lane.run(rx)));
            senders.push(LaneSender { tx, gauges: Arc::clone(&gauges) });
            self.lane_gauges.push(gauges);
        }

        // Subscribe last: every commit from here on is delivered
        let subscription = self.source.subscribe();
        let pipeline = CommitPipeline::new(
            Arc::clone(&self.mapping),
            self.config.module_id.clone(),
            Arc::clone(&self.stats),
        );
        self.pipeline_handle = Some(tokio::spawn(pipeline::run_pipeline(
            pipeline,
            subscription,
            senders,
            shutdown_rx,
        )));
        self.shutdown_tx = Some(shutdown_tx);

        self.set_state(EngineState::Running);
        info!(lanes = self.lane_handles.len(), "Replication engine running");
        Ok(())
    }

    /// Stop gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Close the subscription (no new commits)
    /// 2. Process commits already delivered
    /// 3. Let every lane dispatch its queue
    /// 4. Wait up to `shutdown_timeout` in total, then abort what is left
    ///
    /// A no-op when already stopped.
    pub async fn stop(&mut self) {
        if self.state() == EngineState::Stopped {
            debug!("Stop requested while stopped, ignoring");
            return;
        }

        info!(module_id = %self.config.module_id, "Stopping replication engine");
        self.set_state(EngineState::Stopping);

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(true);
        }

        let timeout = self.config.settings.dispatch.shutdown_timeout_duration();
        let deadline = tokio::time::Instant::now() + timeout;

        // Pipeline first: it owns the lane senders
        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::with_capacity(self.lane_handles.len() + 1);
        if let Some(handle) = self.pipeline_handle.take() {
            handles.push(("pipeline".to_string(), handle));
        }
        handles.extend(self.lane_handles.drain(..).enumerate().map(|(i, h)| (format!("lane-{i}"), h)));

        let results = futures::future::join_all(
            handles
                .iter_mut()
                .map(|(_, handle)| tokio::time::timeout_at(deadline, handle)),
        )
        .await;

        let mut timed_out = 0;
        for ((task, handle), result) in handles.iter().zip(results) {
            match result {
                Ok(Ok(())) => debug!(task = %task, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = %task, error = %e, "Task panicked during shutdown"),
                Err(_) => {
                    handle.abort();
                    timed_out += 1;
                    warn!(task = %task, timeout_ms = timeout.as_millis() as u64, "Task aborted at shutdown timeout");
                }
            }
        }

        if timed_out > 0 {
            let lost: usize = self
                .lane_gauges
                .iter()
                .map(|g| g.queued.load(Ordering::Relaxed) + g.parked.load(Ordering::Relaxed))
                .sum();
            if lost > 0 {
                warn!(documents = lost, "Documents not dispatched before shutdown timeout");
                metrics::record_abandoned(&self.config.module_id, "shutdown_timeout", lost);
                EngineStats::add(&self.stats.documents_abandoned, lost);
            }
        }
        for gauges in &self.lane_gauges {
            gauges.queued.store(0, Ordering::Relaxed);
            gauges.parked.store(0, Ordering::Relaxed);
        }

        self.set_state(EngineState::Stopped);
        let stats = self.stats.snapshot();
        info!(
            commits = stats.commits,
            written = stats.documents_written,
            abandoned = stats.documents_abandoned,
            "Replication engine stopped"
        );
    }
}
