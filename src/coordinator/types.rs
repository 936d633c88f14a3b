//! Engine state, counters and health snapshot types.
//!
//! # State Transitions
//!
//! ```text
//!            start()                 (subscribed, lanes up)
//! Stopped ───────────→ Starting ──────────────────────────→ Running
//!    ↑                                                         │
//!    │          (lanes drained or timed out)                   │ stop()
//!    └─────────────────────────── Stopping ←───────────────────┘
//! ```
//!
//! - **Stopped**: no subscription, no tasks. Safe to drop or restart.
//! - **Starting**: `start()` in progress.
//! - **Running**: commits are extracted, built and dispatched.
//! - **Stopping**: `stop()` in progress; buffered commits and lane queues drain.

use crate::circuit_breaker::IndexCircuitMetrics;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// State of the replication engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Running totals shared by the pipeline and lane tasks.
///
/// Totals survive a stop/start cycle.
#[derive(Debug, Default)]
pub struct EngineStats {
    pub(crate) commits: AtomicU64,
    pub(crate) changes: AtomicU64,
    pub(crate) extraction_errors: AtomicU64,
    pub(crate) build_errors: AtomicU64,
    pub(crate) documents_built: AtomicU64,
    pub(crate) documents_written: AtomicU64,
    pub(crate) documents_failed: AtomicU64,
    pub(crate) documents_recovered: AtomicU64,
    pub(crate) documents_abandoned: AtomicU64,
}

impl EngineStats {
    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            commits: load(&self.commits),
            changes: load(&self.changes),
            extraction_errors: load(&self.extraction_errors),
            build_errors: load(&self.build_errors),
            documents_built: load(&self.documents_built),
            documents_written: load(&self.documents_written),
            documents_failed: load(&self.documents_failed),
            documents_recovered: load(&self.documents_recovered),
            documents_abandoned: load(&self.documents_abandoned),
        }
    }
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Commits processed by the pipeline.
    pub commits: u64,
    /// Entity changes extracted.
    pub changes: u64,
    pub extraction_errors: u64,
    pub build_errors: u64,
    /// Document operations handed to the lanes.
    pub documents_built: u64,
    /// Operations acknowledged by the index (after collapse).
    pub documents_written: u64,
    /// Operations that failed a dispatch, including ones later recovered.
    pub documents_failed: u64,
    /// Parked operations written by a retry pass.
    pub documents_recovered: u64,
    /// Operations given up on for good.
    pub documents_abandoned: u64,
}

/// Queue and park gauges for one dispatch lane.
#[derive(Debug, Default)]
pub(crate) struct LaneGauges {
    pub queued: AtomicUsize,
    pub parked: AtomicUsize,
}

/// Health of one dispatch lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LaneHealth {
    pub lane: usize,
    /// Documents waiting to be dispatched.
    pub queued: usize,
    /// Documents waiting for a retry pass.
    pub parked: usize,
}

/// Health snapshot for monitoring endpoints.
///
/// Collected from cached state only; no index I/O.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub module_id: String,
    pub state: EngineState,

    /// Running and the index circuit is not open.
    pub ready: bool,

    /// Ready and nothing has been abandoned.
    pub healthy: bool,

    pub lanes: Vec<LaneHealth>,
    pub queued_total: usize,
    pub parked_total: usize,

    pub circuit: IndexCircuitMetrics,
    pub circuit_open: bool,

    pub stats: StatsSnapshot,
}
