// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! JSON mapping strategy.
//!
//! Parses a mapping document into a decision table once; resolution afterwards
//! is read-only and lock-free.
//!
//! ```json
//! {
//!   "defaults": {
//!     "keyProperty": "uuid",
//!     "defaultNodesIndex": "default-index-node",
//!     "defaultRelationshipsIndex": "default-index-relationship",
//!     "relationships": "all"
//!   },
//!   "nodeMappings": [
//!     {"labels": ["Person"], "type": "persons"},
//!     {"labels": ["Female"], "index": "females", "type": "girls"}
//!   ],
//!   "relationshipMappings": [
//!     {"labels": ["WORKS_FOR"], "type": "workers"}
//!   ]
//! }
//! ```

use super::rule::{MappingDefaults, MappingRule, RelationshipPolicy};
use super::Mapping;
use crate::error::{ReplicationError, Result};
use crate::graph::EntityKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use tracing::{debug, info};

/// The mapping document as written by the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MappingRepresentation {
    pub defaults: MappingDefaults,
    #[serde(default, alias = "node_mappings")]
    pub node_mappings: Vec<RuleRepresentation>,
    #[serde(default, alias = "relationship_mappings")]
    pub relationship_mappings: Vec<RuleRepresentation>,
}

/// One entry of `nodeMappings` / `relationshipMappings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuleRepresentation {
    /// Labels for node rules, relationship type for relationship rules.
    #[serde(default, alias = "types")]
    pub labels: Vec<String>,
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default, rename = "type")]
    pub doc_type: Option<String>,
    #[serde(default)]
    pub properties: Option<Vec<String>>,
    #[serde(default, alias = "excluded_properties")]
    pub excluded_properties: Vec<String>,
    #[serde(default)]
    pub policy: Option<RelationshipPolicy>,
}

/// Mapping loaded from a JSON document.
#[derive(Debug)]
pub struct JsonFileMapping {
    source: String,
    representation: MappingRepresentation,
    /// Labeled node rules, most specific first.
    node_rules: Vec<MappingRule>,
    node_fallback: MappingRule,
    /// Typed relationship rules, most specific first.
    relationship_rules: Vec<MappingRule>,
    relationship_fallback: MappingRule,
}

impl JsonFileMapping {
    /// Load and compile a mapping file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ReplicationError::MappingIo {
            path: path.display().to_string(),
            source,
        })?;
        let mapping = Self::from_json_str(&raw, path.display().to_string())?;
        info!(file = %path.display(), "Loaded mapping file");
        Ok(mapping)
    }

    /// Compile a mapping from a JSON string.
    pub fn from_json_str(raw: &str, source: impl Into<String>) -> Result<Self> {
        let representation: MappingRepresentation = serde_json::from_str(raw)?;
        Self::from_representation(representation, source)
    }

    /// Compile a mapping from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value, source: impl Into<String>) -> Result<Self> {
        let representation: MappingRepresentation = serde_json::from_value(value)?;
        Self::from_representation(representation, source)
    }

    /// Validate and compile a parsed mapping document.
    pub fn from_representation(
        representation: MappingRepresentation,
        source: impl Into<String>,
    ) -> Result<Self> {
        let source = source.into();
        validate_defaults(&representation.defaults)?;

        let defaults = &representation.defaults;
        let (node_rules, node_wildcard) =
            compile_rules(&representation.node_mappings, EntityKind::Node, defaults)?;
        let (relationship_rules, relationship_wildcard) = compile_rules(
            &representation.relationship_mappings,
            EntityKind::Relationship,
            defaults,
        )?;

        let node_fallback =
            node_wildcard.unwrap_or_else(|| MappingRule::fallback(EntityKind::Node, defaults));
        let relationship_fallback = relationship_wildcard
            .unwrap_or_else(|| MappingRule::fallback(EntityKind::Relationship, defaults));

        debug!(
            source = %source,
            node_rules = node_rules.len(),
            relationship_rules = relationship_rules.len(),
            relationships = ?defaults.relationships,
            "Compiled mapping"
        );

        Ok(Self {
            source,
            representation,
            node_rules,
            node_fallback,
            relationship_rules,
            relationship_fallback,
        })
    }

    /// The document this mapping was compiled from.
    pub fn representation(&self) -> &MappingRepresentation {
        &self.representation
    }

    /// Where the mapping came from (file path or `inline`).
    pub fn source(&self) -> &str {
        &self.source
    }

    fn rules_for(&self, kind: EntityKind) -> (&[MappingRule], &MappingRule) {
        match kind {
            EntityKind::Node => (&self.node_rules, &self.node_fallback),
            EntityKind::Relationship => (&self.relationship_rules, &self.relationship_fallback),
        }
    }
}

impl Mapping for JsonFileMapping {
    fn name(&self) -> &str {
        "json_file"
    }

    fn defaults(&self) -> &MappingDefaults {
        &self.representation.defaults
    }

    fn resolve(&self, labels: &BTreeSet<String>, kind: EntityKind) -> Vec<&MappingRule> {
        let (rules, fallback) = self.rules_for(kind);
        let matched: Vec<&MappingRule> = rules.iter().filter(|r| r.matches(labels)).collect();
        if matched.is_empty() {
            vec![fallback]
        } else {
            matched
        }
    }

    fn includes_relationship(&self, rel_type: &str) -> bool {
        let labels = BTreeSet::from([rel_type.to_string()]);
        let explicit: Vec<&MappingRule> = self
            .relationship_rules
            .iter()
            .filter(|r| r.matches(&labels))
            .collect();

        let vetoed = explicit
            .iter()
            .any(|r| r.relationship_policy == Some(RelationshipPolicy::None));
        let opted_in = explicit
            .iter()
            .any(|r| r.relationship_policy == Some(RelationshipPolicy::All));

        match self.defaults().relationships {
            RelationshipPolicy::All => !vetoed,
            RelationshipPolicy::None => opted_in && !vetoed,
            RelationshipPolicy::ByType => !explicit.is_empty() && !vetoed,
        }
    }
}

fn validate_defaults(defaults: &MappingDefaults) -> Result<()> {
    let required = [
        ("keyProperty", &defaults.key_property),
        ("defaultNodesIndex", &defaults.default_nodes_index),
        ("defaultRelationshipsIndex", &defaults.default_relationships_index),
        ("defaultNodesType", &defaults.default_nodes_type),
        ("defaultRelationshipsType", &defaults.default_relationships_type),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(ReplicationError::Config(format!(
                "defaults.{field} must not be empty"
            )));
        }
    }
    Ok(())
}

/// Compile one rule list. Returns labeled rules sorted most specific first
/// and the wildcard rule, if any.
fn compile_rules(
    entries: &[RuleRepresentation],
    kind: EntityKind,
    defaults: &MappingDefaults,
) -> Result<(Vec<MappingRule>, Option<MappingRule>)> {
    let section = match kind {
        EntityKind::Node => "nodeMappings",
        EntityKind::Relationship => "relationshipMappings",
    };

    let mut rules = Vec::with_capacity(entries.len());
    let mut wildcard: Option<MappingRule> = None;
    let mut seen: HashSet<(BTreeSet<String>, String, String)> = HashSet::new();

    for (i, entry) in entries.iter().enumerate() {
        let at = format!("{section}[{i}]");

        let doc_type = match entry.doc_type.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(ReplicationError::Config(format!("{at}: missing type"))),
        };
        let index = match entry.index.as_deref().map(str::trim) {
            Some("") => return Err(ReplicationError::Config(format!("{at}: empty index"))),
            Some(index) => index.to_string(),
            None => defaults.index_for(kind).to_string(),
        };
        if entry.labels.iter().any(|l| l.trim().is_empty()) {
            return Err(ReplicationError::Config(format!("{at}: empty label")));
        }
        if kind == EntityKind::Node && entry.policy.is_some() {
            return Err(ReplicationError::Config(format!(
                "{at}: policy only applies to relationshipMappings"
            )));
        }
        let mut excluded = defaults.excluded_properties.clone();
        excluded.extend(entry.excluded_properties.iter().cloned());

        let rule = MappingRule {
            kind,
            match_labels: entry.labels.iter().cloned().collect(),
            index,
            doc_type,
            key_property: defaults.key_property.clone(),
            included_properties: entry
                .properties
                .as_ref()
                .map(|props| props.iter().cloned().collect()),
            excluded_properties: excluded,
            relationship_policy: entry.policy,
        };

        let identity = (
            rule.match_labels.clone(),
            rule.index.clone(),
            rule.doc_type.clone(),
        );
        if !seen.insert(identity) {
            return Err(ReplicationError::Config(format!(
                "{at}: duplicate rule for labels {:?} -> {}/{}",
                rule.match_labels, rule.index, rule.doc_type
            )));
        }

        if rule.is_wildcard() {
            if wildcard.is_some() {
                return Err(ReplicationError::Config(format!(
                    "{at}: more than one wildcard rule in {section}"
                )));
            }
            wildcard = Some(rule);
        } else {
            rules.push(rule);
        }
    }

    // Stable: equal specificity keeps declaration order
    rules.sort_by(|a, b| b.match_labels.len().cmp(&a.match_labels.len()));
    Ok((rules, wildcard))
}
