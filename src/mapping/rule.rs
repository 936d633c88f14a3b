// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mapping rules and defaults.

use crate::graph::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which relationships are replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipPolicy {
    /// Every relationship, unless a matching rule opts its type out.
    All,
    /// No relationship, unless a matching rule opts its type in.
    #[default]
    None,
    /// Only relationship types that have an explicit mapping rule.
    ByType,
}

/// Mapping-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MappingDefaults {
    /// Property holding the stable business key used as document id.
    #[serde(default = "default_key_property", alias = "key_property")]
    pub key_property: String,

    /// Index for nodes whose rule does not name one.
    #[serde(alias = "default_nodes_index", alias = "nodes_index")]
    pub default_nodes_index: String,

    /// Index for relationships whose rule does not name one.
    #[serde(alias = "default_relationships_index", alias = "relationships_index")]
    pub default_relationships_index: String,

    /// Type for nodes that match no rule.
    #[serde(default = "default_nodes_type", alias = "default_nodes_type")]
    pub default_nodes_type: String,

    /// Type for relationships that match no rule.
    #[serde(default = "default_relationships_type", alias = "default_relationships_type")]
    pub default_relationships_type: String,

    /// Relationship inclusion policy.
    #[serde(default)]
    pub relationships: RelationshipPolicy,

    /// Properties never copied into any document.
    #[serde(default, alias = "excluded_properties")]
    pub excluded_properties: BTreeSet<String>,
}

fn default_key_property() -> String {
    "uuid".to_string()
}

fn default_nodes_type() -> String {
    "nodes".to_string()
}

fn default_relationships_type() -> String {
    "relationships".to_string()
}

impl MappingDefaults {
    /// Defaults with the given indices and everything else at its default.
    pub fn new(nodes_index: &str, relationships_index: &str) -> Self {
        Self {
            key_property: default_key_property(),
            default_nodes_index: nodes_index.to_string(),
            default_relationships_index: relationships_index.to_string(),
            default_nodes_type: default_nodes_type(),
            default_relationships_type: default_relationships_type(),
            relationships: RelationshipPolicy::default(),
            excluded_properties: BTreeSet::new(),
        }
    }

    /// Default index for an entity kind.
    pub fn index_for(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Node => &self.default_nodes_index,
            EntityKind::Relationship => &self.default_relationships_index,
        }
    }

    /// Default type for an entity kind.
    pub fn type_for(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Node => &self.default_nodes_type,
            EntityKind::Relationship => &self.default_relationships_type,
        }
    }
}

/// A compiled binding from a label set to an index/type destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    pub kind: EntityKind,
    /// Labels (or the relationship type) an entity must carry. Empty means
    /// this is the fallback rule for its kind.
    pub match_labels: BTreeSet<String>,
    pub index: String,
    pub doc_type: String,
    pub key_property: String,
    /// When set, only these properties (plus the key) are copied.
    pub included_properties: Option<BTreeSet<String>>,
    pub excluded_properties: BTreeSet<String>,
    /// Per-type override of the default relationship policy.
    pub relationship_policy: Option<RelationshipPolicy>,
}

impl MappingRule {
    /// Synthetic fallback rule built from the defaults.
    pub fn fallback(kind: EntityKind, defaults: &MappingDefaults) -> Self {
        Self {
            kind,
            match_labels: BTreeSet::new(),
            index: defaults.index_for(kind).to_string(),
            doc_type: defaults.type_for(kind).to_string(),
            key_property: defaults.key_property.clone(),
            included_properties: None,
            excluded_properties: defaults.excluded_properties.clone(),
            relationship_policy: None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.match_labels.is_empty()
    }

    /// Subset match: every rule label is present on the entity.
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        !self.is_wildcard() && self.match_labels.is_subset(labels)
    }

    /// `(index, type)` this rule writes to.
    pub fn destination(&self) -> (&str, &str) {
        (&self.index, &self.doc_type)
    }

    /// Whether a property is copied into documents of this rule.
    pub fn projects(&self, property: &str) -> bool {
        if property == self.key_property {
            return true;
        }
        if self.excluded_properties.contains(property) {
            return false;
        }
        match &self.included_properties {
            Some(included) => included.contains(property),
            None => true,
        }
    }
}
