//! Circuit breaker around bulk writes to the search index.
//!
//! When the index keeps failing, the writer stops sending requests for a
//! while instead of stacking retries on an overloaded cluster. The breaker
//! opens on the `failure_threshold`-th failure in a row. It then rejects
//! calls for `recovery_timeout` and afterwards lets probe requests through:
//! `success_threshold` successful probes close it again, a failed probe
//! reopens it.
//!
//! `recloser` owns the open/half-open timing. It only evaluates a window once
//! the window is full, so the consecutive-failure count lives here and a
//! failure is reported to `recloser` only when it trips the breaker.
//!
//! A rejected call is reported to the writer as a transient failure of that
//! attempt, so it is retried with backoff like any transport error.
//!
//! ```rust,no_run
//! # use graph_index_replicator::circuit_breaker::{IndexCircuit, CircuitError};
//! # use graph_index_replicator::IndexError;
//! # async fn example() {
//! let circuit = IndexCircuit::new();
//!
//! match circuit.bulk.call(|| async { Ok::<_, IndexError>(()) }).await {
//!     Ok(()) => { /* written */ }
//!     Err(CircuitError::Rejected) => { /* index presumed down, back off */ }
//!     Err(CircuitError::Inner(e)) => { /* request failed: {e} */ }
//! }
//! # }
//! ```

use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure rate at or above which a full `recloser` window counts as failed:
/// any reported failure.
const ANY_REPORTED_FAILURE: f32 = f32::MIN_POSITIVE;

/// Smallest usable threshold. `recloser` never evaluates the first call after
/// a state change, so that call can neither trip nor close the breaker.
const MIN_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::HalfOpen,
            2 => Self::Open,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        })
    }
}

/// Outcome of a call the breaker refused or that failed on its own.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("request failed: {0}")]
    Inner(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected)
    }
}

/// Breaker tuning. Built from the `settings.circuit` section of the
/// replication config. Both thresholds are raised to at least 2.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    /// Consecutive failed calls that open the breaker.
    pub failure_threshold: u32,
    /// Consecutive successful probes that close it again.
    pub success_threshold: u32,
    /// Time spent open before probing.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips late and recovers fast. For tests that exercise retries rather
    /// than the breaker.
    #[must_use]
    pub fn tolerant() -> Self {
        Self {
            failure_threshold: 100,
            success_threshold: MIN_THRESHOLD,
            recovery_timeout: Duration::from_millis(10),
        }
    }
}

/// A named breaker with call counters.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    failure_threshold: u32,
    success_threshold: u32,
    /// State as tracked from call outcomes.
    observed: AtomicU8,
    /// Failures in a row while closed.
    consecutive_failures: AtomicU32,
    /// Probes since the breaker went half-open, and the successful ones in a row.
    probes: AtomicU32,
    probe_streak: AtomicU32,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let failure_threshold = config.failure_threshold.max(MIN_THRESHOLD);
        let success_threshold = config.success_threshold.max(MIN_THRESHOLD);

        // Closed: a window of one call, so the reported failure trips at once.
        // Half-open: the first probe fills the window, the next
        // `success_threshold - 1` decide.
        let recloser = Recloser::custom()
            .error_rate(ANY_REPORTED_FAILURE)
            .closed_len(1)
            .half_open_len((success_threshold - 1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            failure_threshold,
            success_threshold,
            observed: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            probe_streak: AtomicU32::new(0),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the breaker is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let reported = |_: &E| self.failure_is_reported();

        match self.inner.call_with(reported, f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                self.on_success();
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "rejected");
                if self.observe(CircuitState::Open) {
                    warn!(circuit = %self.name, "Circuit open, index requests suspended");
                }
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                self.on_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Whether a failure completing now counts against the `recloser` window.
    /// While closed only the tripping failure does; every failed probe does.
    fn failure_is_reported(&self) -> bool {
        self.state() != CircuitState::Closed
            || self.consecutive_failures.load(Ordering::Relaxed) + 1 >= self.failure_threshold
    }

    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.state() == CircuitState::Closed {
            return;
        }

        let (probe, decided) = self.next_probe();
        let streak = self.probe_streak.fetch_add(1, Ordering::Relaxed) + 1;
        if decided && streak + 1 >= self.success_threshold && self.observe(CircuitState::Closed) {
            info!(circuit = %self.name, probes = probe, "Circuit closed, index recovered");
        }
    }

    fn on_failure(&self) {
        if self.state() == CircuitState::Closed {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= self.failure_threshold && self.observe(CircuitState::Open) {
                warn!(circuit = %self.name, failures, "Circuit opened, index requests suspended");
            }
            return;
        }

        let (probe, decided) = self.next_probe();
        self.probe_streak.store(0, Ordering::Relaxed);
        if decided && self.observe(CircuitState::Open) {
            warn!(circuit = %self.name, probe, "Probe failed, circuit reopened");
        }
    }

    /// Count a probe. Returns its number since the breaker went half-open and
    /// whether `recloser` decides on it.
    fn next_probe(&self) -> (u32, bool) {
        // A call that got through an open breaker is the first probe
        if self.state() == CircuitState::Open {
            self.probes.store(0, Ordering::Relaxed);
            self.probe_streak.store(0, Ordering::Relaxed);
            self.observe(CircuitState::HalfOpen);
        }
        let probe = self.probes.fetch_add(1, Ordering::Relaxed) + 1;
        (probe, probe >= self.success_threshold)
    }

    /// Record a state change. Returns whether the state actually changed.
    fn observe(&self, next: CircuitState) -> bool {
        let prev = CircuitState::from(self.observed.swap(next as u8, Ordering::Relaxed));
        if prev == next {
            return false;
        }
        debug!(circuit = %self.name, from = %prev, to = %next, "Circuit state changed");
        metrics::set_circuit_state(&self.name, &next.to_string());
        true
    }

    /// Current state. An open breaker reads `Open` until a call gets through
    /// after `recovery_timeout`.
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.observed.load(Ordering::Relaxed))
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// Breakers guarding the search index. Shared by every dispatch lane, so an
/// outage seen by one lane holds back all of them.
pub struct IndexCircuit {
    pub bulk: CircuitBreaker,
}

impl Default for IndexCircuit {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexCircuit {
    pub fn new() -> Self {
        Self::with_config(CircuitConfig::default())
    }

    pub fn with_config(config: CircuitConfig) -> Self {
        Self {
            bulk: CircuitBreaker::new("index_bulk", config),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.bulk.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn metrics(&self) -> IndexCircuitMetrics {
        IndexCircuitMetrics {
            state: self.bulk.state(),
            calls_total: self.bulk.calls_total(),
            successes: self.bulk.successes(),
            failures: self.bulk.failures(),
            rejections: self.bulk.rejections(),
        }
    }
}

/// Counters of the index circuit, reported in health checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexCircuitMetrics {
    pub state: CircuitState,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexError;

    fn window(failures: u32) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: failures,
            success_threshold: 2,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    async fn failing_bulk(cb: &CircuitBreaker) -> Result<(), CircuitError<IndexError>> {
        cb.call(|| async { Err(IndexError::new("503 service unavailable")) }).await
    }

    async fn good_bulk(cb: &CircuitBreaker) -> Result<usize, CircuitError<IndexError>> {
        cb.call(|| async { Ok(3) }).await
    }

    #[tokio::test]
    async fn test_successful_bulk_passes_through() {
        let cb = CircuitBreaker::new("test", window(2));

        assert_eq!(good_bulk(&cb).await.unwrap(), 3);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_is_passed_back() {
        let cb = CircuitBreaker::new("test", window(2));

        let err = failing_bulk(&cb).await.unwrap_err();
        assert!(!err.is_rejected());
        assert!(err.to_string().contains("503"));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_trips_on_threshold_failure() {
        let cb = CircuitBreaker::new("test", window(3));

        for _ in 0..2 {
            assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.failures(), 3);
        assert_eq!(cb.rejections(), 1);
    }

    #[tokio::test]
    async fn test_trips_on_threshold_failure_after_successes() {
        let cb = CircuitBreaker::new("test", window(3));
        for _ in 0..5 {
            good_bulk(&cb).await.unwrap();
        }

        for _ in 0..3 {
            assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        }
        assert!(failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_run() {
        let cb = CircuitBreaker::new("test", window(3));

        for _ in 0..4 {
            let _ = failing_bulk(&cb).await;
            let _ = failing_bulk(&cb).await;
            good_bulk(&cb).await.unwrap();
        }
        assert_eq!(cb.rejections(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_probes_close_after_recovery_timeout() {
        let cb = CircuitBreaker::new("test", window(2));

        for _ in 0..3 {
            let _ = failing_bulk(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.rejections(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        good_bulk(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        good_bulk(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);

        // Closed again: a fresh run of failures is needed to trip
        assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new("test", window(2));
        for _ in 0..2 {
            let _ = failing_bulk(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;
        good_bulk(&cb).await.unwrap();
        assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(failing_bulk(&cb).await.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_thresholds_below_two_are_raised() {
        let config = CircuitConfig { failure_threshold: 1, success_threshold: 0, ..window(1) };
        let cb = CircuitBreaker::new("test", config);

        assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(!failing_bulk(&cb).await.unwrap_err().is_rejected());
        assert!(failing_bulk(&cb).await.unwrap_err().is_rejected());
    }

    #[tokio::test]
    async fn test_index_circuit_metrics() {
        let circuit = IndexCircuit::with_config(CircuitConfig::tolerant());
        assert_eq!(circuit.bulk.name(), "index_bulk");

        good_bulk(&circuit.bulk).await.unwrap();
        let _ = failing_bulk(&circuit.bulk).await;

        assert_eq!(
            circuit.metrics(),
            IndexCircuitMetrics {
                state: CircuitState::Closed,
                calls_total: 2,
                successes: 1,
                failures: 1,
                rejections: 0,
            }
        );
        assert!(!circuit.is_open());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
        assert_eq!(CircuitState::from(2), CircuitState::Open);
        assert_eq!(CircuitState::from(9), CircuitState::Closed);
    }
}
