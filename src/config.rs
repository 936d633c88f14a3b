//! Configuration for the replicator.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use graph_index_replicator::config::ReplicationConfig;
//! use graph_index_replicator::mapping::MappingConfig;
//!
//! let config = ReplicationConfig {
//!     module_id: "ES".into(),
//!     mapping: MappingConfig::JsonFile { file: "/etc/replicator/mapping.json".into() },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── module_id: String            # Label in logs and metrics
//! ├── mapping: MappingConfig       # json_file | inline
//! └── settings: ReplicationSettings
//!     ├── writer: WriterConfig     # Bulk size, retries, rate limit
//!     ├── dispatch: DispatchConfig # Lanes, shutdown timeout
//!     ├── retry_pass: RetryPassConfig
//!     ├── circuit: CircuitBreakerConfig
//!     └── slo: SloConfig
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! module_id: "ES"
//!
//! mapping:
//!   strategy: json_file
//!   file: "/etc/replicator/mapping.json"
//!
//! settings:
//!   writer:
//!     bulk_size: 500
//!     max_attempts: 5
//!   dispatch:
//!     workers: 4
//!     shutdown_timeout: "10s"
//!   retry_pass:
//!     enabled: true
//!     interval_sec: 30
//! ```

use crate::circuit_breaker::CircuitConfig;
use crate::error::{ReplicationError, Result};
use crate::mapping::MappingConfig;
use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the host to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Identifies this replicator instance in logs and metrics.
    #[serde(default = "default_module_id")]
    pub module_id: String,

    /// Where the label mapping comes from.
    #[serde(default)]
    pub mapping: MappingConfig,

    /// Tunables for dispatch, retries and SLOs.
    #[serde(default)]
    pub settings: ReplicationSettings,
}

fn default_module_id() -> String {
    "ES".to_string()
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            module_id: default_module_id(),
            mapping: MappingConfig::default(),
            settings: ReplicationSettings::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a config for tests: inline mapping, fast retries, two lanes.
    pub fn for_testing(mapping: serde_json::Value) -> Self {
        Self {
            module_id: "test".to_string(),
            mapping: MappingConfig::Inline { document: mapping },
            settings: ReplicationSettings::for_testing(),
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.module_id.trim().is_empty() {
            return Err(ReplicationError::Config("module_id must not be empty".into()));
        }
        self.settings.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub retry_pass: RetryPassConfig,
    #[serde(default)]
    pub circuit: CircuitBreakerConfig,
    #[serde(default)]
    pub slo: SloConfig,
}

impl ReplicationSettings {
    pub fn for_testing() -> Self {
        Self {
            writer: WriterConfig {
                max_attempts: 3,
                initial_backoff_ms: 5,
                max_backoff_ms: 50,
                request_timeout: "1s".to_string(),
                ..WriterConfig::default()
            },
            dispatch: DispatchConfig {
                workers: 2,
                lane_capacity: 1000,
                shutdown_timeout: "2s".to_string(),
            },
            retry_pass: RetryPassConfig::default(),
            circuit: CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 2,
                recovery_timeout_ms: 50,
            },
            slo: SloConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.workers == 0 {
            return Err(ReplicationError::Config("dispatch.workers must be at least 1".into()));
        }
        if self.dispatch.lane_capacity == 0 {
            return Err(ReplicationError::Config("dispatch.lane_capacity must be at least 1".into()));
        }
        if self.writer.bulk_size == 0 {
            return Err(ReplicationError::Config("writer.bulk_size must be at least 1".into()));
        }
        if self.writer.max_attempts == 0 {
            return Err(ReplicationError::Config("writer.max_attempts must be at least 1".into()));
        }
        if !(self.writer.backoff_factor.is_finite() && self.writer.backoff_factor >= 1.0) {
            return Err(ReplicationError::Config("writer.backoff_factor must be >= 1.0".into()));
        }
        if humantime::parse_duration(&self.dispatch.shutdown_timeout).is_err() {
            return Err(ReplicationError::Config(format!(
                "dispatch.shutdown_timeout is not a duration: {:?}",
                self.dispatch.shutdown_timeout
            )));
        }
        if humantime::parse_duration(&self.writer.request_timeout).is_err() {
            return Err(ReplicationError::Config(format!(
                "writer.request_timeout is not a duration: {:?}",
                self.writer.request_timeout
            )));
        }
        if self.retry_pass.enabled && self.retry_pass.max_passes == 0 {
            return Err(ReplicationError::Config("retry_pass.max_passes must be at least 1".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WriterConfig: bulk dispatch
// ═══════════════════════════════════════════════════════════════════════════════

/// Bulk writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Maximum documents per bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Attempts per chunk, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Per-request timeout as a duration string (e.g., "30s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting
    // ─────────────────────────────────────────────────────────────────────────

    /// Bound the documents sent to the index per second.
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained documents per second.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst above the sustained rate.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_bulk_size() -> usize {
    500
}

fn default_max_attempts() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            bulk_size: default_bulk_size(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_factor: default_backoff_factor(),
            request_timeout: default_request_timeout(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl WriterConfig {
    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Backoff policy for bulk retries.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            backoff_factor: self.backoff_factor,
            request_timeout: self.request_timeout_duration(),
        }
    }

    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DispatchConfig: per-key ordered lanes
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatch lane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of lanes dispatching concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Batches a lane may queue before the pipeline waits.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// How long `stop()` waits for lanes to drain (e.g., "10s").
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_workers() -> usize {
    4
}

fn default_lane_capacity() -> usize {
    10_000
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            lane_capacity: default_lane_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RetryPassConfig: second chance for documents that exhausted their retries
// ═══════════════════════════════════════════════════════════════════════════════

/// Periodic retry of documents whose dispatch failed terminally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPassConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between passes.
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u64,

    /// Parked documents per lane before new failures are abandoned.
    #[serde(default = "default_max_parked_per_lane")]
    pub max_parked_per_lane: usize,

    /// Passes a document gets before it is abandoned.
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
}

fn default_interval_sec() -> u64 {
    30
}

fn default_max_parked_per_lane() -> usize {
    10_000
}

fn default_max_passes() -> u32 {
    10
}

impl Default for RetryPassConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: default_interval_sec(),
            max_parked_per_lane: default_max_parked_per_lane(),
            max_passes: default_max_passes(),
        }
    }
}

impl RetryPassConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_sec.max(1))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CircuitBreakerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Circuit breaker around bulk writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_circuit_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_circuit_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_success_threshold() -> u32 {
    2
}

fn default_circuit_recovery_timeout_ms() -> u64 {
    30_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            success_threshold: default_circuit_success_threshold(),
            recovery_timeout_ms: default_circuit_recovery_timeout_ms(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold.max(2),
            success_threshold: self.success_threshold.max(2),
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SloConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SLO thresholds. Violations are logged and counted, never enforced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloConfig {
    /// Maximum acceptable time to dispatch one lane batch (ms).
    #[serde(default = "default_max_dispatch_latency_ms")]
    pub max_dispatch_latency_ms: u64,
}

fn default_max_dispatch_latency_ms() -> u64 {
    500
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            max_dispatch_latency_ms: default_max_dispatch_latency_ms(),
        }
    }
}

impl SloConfig {
    pub fn is_dispatch_violation(&self, latency: Duration) -> bool {
        latency.as_millis() as u64 > self.max_dispatch_latency_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
