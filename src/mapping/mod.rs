// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mapping from graph labels to search-index destinations.
//!
//! A [`Mapping`] is compiled once at startup into an immutable decision table
//! and shared by the pipeline as `Arc<dyn Mapping>`.
//!
//! # Resolution
//!
//! ```text
//! labels {Person, Female}
//!     │
//!     ├─ rule {Person, Female} ─▶ match (2 labels, listed first)
//!     ├─ rule {Person}         ─▶ match
//!     ├─ rule {Female}         ─▶ match
//!     └─ rule {Company}        ─▶ no
//!
//! nothing matched? ─▶ wildcard rule, else synthetic rule from defaults
//! ```
//!
//! Strategies are selected explicitly through [`MappingConfig`].

mod json;
mod rule;

pub use json::{JsonFileMapping, MappingRepresentation, RuleRepresentation};
pub use rule::{MappingDefaults, MappingRule, RelationshipPolicy};

use crate::error::Result;
use crate::graph::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

/// A compiled mapping strategy.
pub trait Mapping: Send + Sync + 'static {
    /// Strategy name, for logs.
    fn name(&self) -> &str;

    fn defaults(&self) -> &MappingDefaults;

    /// Property holding the document id.
    fn key_property(&self) -> &str {
        &self.defaults().key_property
    }

    /// Rules an entity with these labels is written under.
    ///
    /// Never empty: when no labeled rule matches, the fallback rule of that
    /// kind is returned alone.
    fn resolve(&self, labels: &BTreeSet<String>, kind: EntityKind) -> Vec<&MappingRule>;

    /// Whether relationships of this type are replicated at all.
    fn includes_relationship(&self, rel_type: &str) -> bool;
}

/// Mapping strategy selection.
///
/// ```yaml
/// mapping:
///   strategy: json_file
///   file: "/etc/replicator/mapping.json"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MappingConfig {
    /// Read the mapping from a JSON file.
    JsonFile { file: PathBuf },
    /// Mapping document embedded in the configuration.
    Inline { document: serde_json::Value },
}

impl MappingConfig {
    /// Load and compile the selected mapping.
    pub fn load(&self) -> Result<Arc<dyn Mapping>> {
        let mapping = match self {
            MappingConfig::JsonFile { file } => JsonFileMapping::from_file(file)?,
            MappingConfig::Inline { document } => {
                JsonFileMapping::from_value(document.clone(), "inline")?
            }
        };
        Ok(Arc::new(mapping))
    }
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig::Inline {
            document: serde_json::json!({
                "defaults": {
                    "defaultNodesIndex": "default-index-node",
                    "defaultRelationshipsIndex": "default-index-relationship"
                }
            }),
        }
    }
}
