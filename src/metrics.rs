//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Commits and entity changes processed
//! - Documents built, written, failed
//! - Bulk write latency and retries
//! - Retry pass (parked / recovered / abandoned documents)
//! - Circuit breaker state
//! - Engine lifecycle and SLO violations
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! `module` labels carry the configured `module_id`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use graph_index_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_commit("ES", 3);
//! metrics::record_bulk_write("ES", 0, 100, 98, 2, Duration::from_millis(40));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Pipeline Metrics
// =============================================================================

/// Record one commit processed and how many entity changes it produced.
pub fn record_commit(module: &str, changes: usize) {
    counter!("replicator_commits_total", "module" => module.to_string()).increment(1);
    histogram!("replicator_commit_changes", "module" => module.to_string()).record(changes as f64);
}

/// Record changes by operation (created, updated, deleted, label_changed).
pub fn record_changes(module: &str, operation: &str, count: usize) {
    counter!(
        "replicator_changes_total",
        "module" => module.to_string(),
        "operation" => operation.to_string()
    )
    .increment(count as u64);
}

/// Record documents built for a commit.
pub fn record_documents_built(module: &str, upserts: usize, deletes: usize) {
    counter!("replicator_documents_built_total", "module" => module.to_string(), "op" => "upsert")
        .increment(upserts as u64);
    counter!("replicator_documents_built_total", "module" => module.to_string(), "op" => "delete")
        .increment(deletes as u64);
}

/// Record time spent turning one commit into documents.
pub fn record_pipeline_latency(module: &str, duration: Duration) {
    histogram!("replicator_pipeline_duration_seconds", "module" => module.to_string())
        .record(duration.as_secs_f64());
}

/// Record errors by type (see `ReplicationError::kind`).
pub fn record_error(module: &str, error_type: &str) {
    counter!(
        "replicator_errors_total",
        "module" => module.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// =============================================================================
// Writer Metrics
// =============================================================================

/// Record one dispatched batch on a lane.
pub fn record_bulk_write(
    module: &str,
    lane: usize,
    total: usize,
    written: usize,
    failed: usize,
    duration: Duration,
) {
    let module = module.to_string();
    let lane = lane.to_string();

    counter!("replicator_documents_total", "module" => module.clone(), "lane" => lane.clone())
        .increment(total as u64);
    counter!("replicator_documents_written_total", "module" => module.clone(), "lane" => lane.clone())
        .increment(written as u64);
    if failed > 0 {
        counter!("replicator_documents_failed_total", "module" => module.clone(), "lane" => lane.clone())
            .increment(failed as u64);
    }

    histogram!("replicator_dispatch_duration_seconds", "module" => module.clone(), "lane" => lane)
        .record(duration.as_secs_f64());
    histogram!("replicator_batch_size", "module" => module).record(total as f64);
}

/// Record collapse efficiency (operations superseded within a batch).
pub fn record_batch_collapse(module: &str, before: usize, after: usize) {
    let collapsed = before.saturating_sub(after);
    if collapsed > 0 {
        counter!("replicator_batch_collapsed_total", "module" => module.to_string())
            .increment(collapsed as u64);
    }
}

/// Record latency of one bulk request.
pub fn record_bulk_request(module: &str, docs: usize, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replicator_bulk_requests_total",
        "module" => module.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("replicator_bulk_request_duration_seconds", "module" => module.to_string())
        .record(duration.as_secs_f64());
    histogram!("replicator_bulk_request_docs", "module" => module.to_string()).record(docs as f64);
}

/// Record a retry of `docs` documents (attempt is 2-based).
pub fn record_bulk_retry(module: &str, attempt: usize, docs: usize) {
    counter!("replicator_bulk_retries_total", "module" => module.to_string()).increment(1);
    counter!("replicator_bulk_retried_documents_total", "module" => module.to_string())
        .increment(docs as u64);
    gauge!("replicator_bulk_last_retry_attempt", "module" => module.to_string()).set(attempt as f64);
}

/// Set the number of documents waiting in a lane.
pub fn set_lane_depth(module: &str, lane: usize, depth: usize) {
    gauge!(
        "replicator_lane_depth",
        "module" => module.to_string(),
        "lane" => lane.to_string()
    )
    .set(depth as f64);
}

// =============================================================================
// Retry Pass Metrics
// =============================================================================

/// Set parked documents on a lane.
pub fn set_parked(module: &str, lane: usize, parked: usize) {
    gauge!(
        "replicator_parked_documents",
        "module" => module.to_string(),
        "lane" => lane.to_string()
    )
    .set(parked as f64);
}

/// Record one retry pass over parked documents.
pub fn record_retry_pass(module: &str, lane: usize, retried: usize, recovered: usize) {
    let module = module.to_string();
    let lane = lane.to_string();
    counter!("replicator_retry_passes_total", "module" => module.clone(), "lane" => lane.clone())
        .increment(1);
    counter!("replicator_retry_pass_documents_total", "module" => module.clone(), "lane" => lane.clone())
        .increment(retried as u64);
    counter!("replicator_retry_pass_recovered_total", "module" => module, "lane" => lane)
        .increment(recovered as u64);
}

/// Record documents given up on for good.
pub fn record_abandoned(module: &str, reason: &str, count: usize) {
    counter!(
        "replicator_documents_abandoned_total",
        "module" => module.to_string(),
        "reason" => reason.to_string()
    )
    .increment(count as u64);
}

// =============================================================================
// Engine Metrics
// =============================================================================

/// Gauge for engine state.
pub fn set_engine_state(module: &str, state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Stopping" => 3.0,
        _ => -1.0,
    };
    gauge!("replicator_engine_state", "module" => module.to_string()).set(value);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replicator_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replicator_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}

// =============================================================================
// SLO Violation Metrics
// =============================================================================

/// Record an SLO violation (latency threshold exceeded).
pub fn record_slo_violation(module: &str, slo_type: &str, latency_ms: u64) {
    counter!(
        "replicator_slo_violations_total",
        "module" => module.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .increment(1);

    histogram!(
        "replicator_slo_violation_latency_ms",
        "module" => module.to_string(),
        "slo_type" => slo_type.to_string()
    )
    .record(latency_ms as f64);
}
