// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replicator.
//!
//! Errors are categorized by the pipeline stage that produced them. Only
//! startup errors are fatal; everything raised while replicating a commit is
//! logged, counted and reported, because the graph transaction has already
//! committed by the time the pipeline runs.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Config` | No | Configuration invalid (fatal at startup) |
//! | `MappingParse` | No | Mapping document is not valid JSON for the schema |
//! | `MappingIo` | No | Mapping file could not be read |
//! | `Extraction` | No | One malformed change, skipped |
//! | `Build` | No | One document could not be built, skipped |
//! | `Index` | Yes | Search index temporarily failing |
//! | `DispatchExhausted` | No | Retries used up, documents reported as lost |
//! | `InvalidState` | No | Lifecycle state machine violation |

use crate::index::IndexError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the operation
/// should be retried.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Invalid or missing configuration.
    ///
    /// Raised while loading the mapping or validating settings.
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Mapping document failed to deserialize.
    #[error("Mapping parse error: {0}")]
    MappingParse(#[from] serde_json::Error),

    /// Mapping file could not be read.
    #[error("Mapping file error ({path}): {source}")]
    MappingIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A single change could not be extracted from a commit.
    ///
    /// The change is skipped; the rest of the commit is still replicated.
    #[error("Extraction error ({entity}): {message}")]
    Extraction { entity: String, message: String },

    /// A single document could not be built.
    ///
    /// Typically an unsupported property value (nested list, NaN).
    #[error("Build error ({key}): {message}")]
    Build { key: String, message: String },

    /// Search index call failed.
    ///
    /// Retryable - the index may be temporarily overloaded or unreachable.
    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    /// Retries were exhausted for some documents of a batch.
    ///
    /// Replication for those documents is considered lost and is surfaced
    /// through logs and metrics.
    #[error("Dispatch failed after {attempts} attempts: {failed} documents not written")]
    DispatchExhausted { attempts: usize, failed: usize },

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl ReplicationError {
    /// Create an extraction error for an entity.
    pub fn extraction(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extraction {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Create a build error for a document key.
    pub fn build(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Build {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Index(_) => true,
            Self::Config(_) => false,
            Self::MappingParse(_) => false,
            Self::MappingIo { .. } => false,
            Self::Extraction { .. } => false,
            Self::Build { .. } => false,
            Self::DispatchExhausted { .. } => false,
            Self::InvalidState { .. } => false,
        }
    }

    /// Short label used for the `error_type` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::MappingParse(_) => "mapping_parse",
            Self::MappingIo { .. } => "mapping_io",
            Self::Extraction { .. } => "extraction",
            Self::Build { .. } => "build",
            Self::Index(_) => "index",
            Self::DispatchExhausted { .. } => "dispatch_exhausted",
            Self::InvalidState { .. } => "invalid_state",
        }
    }
}
