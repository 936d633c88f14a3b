// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Document building: entity change + mapping rules → index documents.
//!
//! # Fan-out
//!
//! One upsert per distinct `(index, type)` destination of the current rules.
//! A label change additionally deletes the document from every destination the
//! entity no longer maps to. Deletes are always per destination; the document
//! id alone never identifies a document.
//!
//! ```text
//! Person:Female ──▶ persons/default-index-node  (upsert, id = uuid)
//!               └─▶ girls/females               (upsert, id = uuid)
//!
//! REMOVE n:Female ──▶ persons/default-index-node  (upsert)
//!                 └─▶ girls/females               (delete)
//! ```

use crate::error::{ReplicationError, Result};
use crate::extract::{ChangeOperation, EntityChange};
use crate::graph::PropertyValue;
use crate::mapping::MappingRule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::fmt;

/// Identity of a document in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub index: String,
    #[serde(rename = "type")]
    pub doc_type: String,
    pub id: String,
}

impl DocKey {
    pub fn new(index: impl Into<String>, doc_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            doc_type: doc_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.index, self.doc_type, self.id)
    }
}

/// A document operation destined for the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub key: DocKey,
    /// Projected properties. Empty for deletes.
    pub fields: Map<String, Value>,
    pub deleted: bool,
    /// Commit sequence that produced this operation.
    pub sequence: u64,
}

impl IndexDocument {
    pub fn upsert(key: DocKey, fields: Map<String, Value>, sequence: u64) -> Self {
        Self { key, fields, deleted: false, sequence }
    }

    pub fn delete(key: DocKey, sequence: u64) -> Self {
        Self { key, fields: Map::new(), deleted: true, sequence }
    }

    pub fn index(&self) -> &str {
        &self.key.index
    }

    pub fn doc_type(&self) -> &str {
        &self.key.doc_type
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Approximate payload size, used for batch metrics.
    pub fn size_bytes(&self) -> usize {
        self.key.index.len()
            + self.key.doc_type.len()
            + self.key.id.len()
            + self
                .fields
                .iter()
                .map(|(k, v)| k.len() + v.to_string().len())
                .sum::<usize>()
    }
}

/// Documents built for one change, and the upserts that could not be built.
#[derive(Debug, Default)]
pub struct BuiltDocuments {
    pub documents: Vec<IndexDocument>,
    /// One `Build` error per destination whose document was skipped.
    pub failures: Vec<ReplicationError>,
}

impl BuiltDocuments {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds index documents for entity changes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentBuilder;

impl DocumentBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build the documents for one change.
    ///
    /// `current_rules` are the rules for the entity's labels after the commit,
    /// `previous_rules` those for its labels before. An unsupported property
    /// value skips the upsert of each destination that projects it. Deletes
    /// never depend on property values and are always emitted.
    pub fn build(
        &self,
        change: &EntityChange,
        current_rules: &[&MappingRule],
        previous_rules: &[&MappingRule],
    ) -> BuiltDocuments {
        let seq = change.sequence;
        let mut built = BuiltDocuments::default();

        match change.operation {
            ChangeOperation::Deleted => {
                for (index, doc_type) in destinations(previous_rules) {
                    built.documents.push(IndexDocument::delete(DocKey::new(index, doc_type, &change.key), seq));
                }
            }
            ChangeOperation::Created | ChangeOperation::Updated => {
                self.upserts(change, current_rules, &mut built);
            }
            ChangeOperation::LabelChanged => {
                self.upserts(change, current_rules, &mut built);
                let current: HashSet<(&str, &str)> = destinations(current_rules).into_iter().collect();
                for (index, doc_type) in destinations(previous_rules) {
                    if !current.contains(&(index, doc_type)) {
                        built.documents.push(IndexDocument::delete(DocKey::new(index, doc_type, &change.key), seq));
                    }
                }
            }
        }

        built
    }

    fn upserts(&self, change: &EntityChange, rules: &[&MappingRule], built: &mut BuiltDocuments) {
        let mut seen = HashSet::new();
        for rule in rules {
            if !seen.insert(rule.destination()) {
                continue;
            }
            match project(change, rule) {
                Ok(fields) => built.documents.push(IndexDocument::upsert(
                    DocKey::new(&rule.index, &rule.doc_type, &change.key),
                    fields,
                    change.sequence,
                )),
                Err(e) => built.failures.push(e),
            }
        }
    }
}

/// Distinct destinations in rule order.
fn destinations<'a>(rules: &[&'a MappingRule]) -> Vec<(&'a str, &'a str)> {
    let mut seen = HashSet::new();
    rules
        .iter()
        .map(|&rule| rule.destination())
        .filter(|dest| seen.insert(*dest))
        .collect()
}

fn project(change: &EntityChange, rule: &MappingRule) -> Result<Map<String, Value>> {
    let mut fields = Map::new();
    for (name, value) in &change.properties_after {
        if !rule.projects(name) {
            continue;
        }
        let value = to_json(value).map_err(|message| {
            ReplicationError::build(&change.key, format!("property '{name}': {message}"))
        })?;
        fields.insert(name.clone(), value);
    }
    Ok(fields)
}

/// Convert a property value, rejecting what a search document cannot hold.
pub fn to_json(value: &PropertyValue) -> std::result::Result<Value, String> {
    match value {
        PropertyValue::List(items) => items
            .iter()
            .map(|item| match item {
                PropertyValue::List(_) => Err("nested lists are not supported".to_string()),
                scalar => scalar_to_json(scalar),
            })
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array),
        scalar => scalar_to_json(scalar),
    }
}

fn scalar_to_json(value: &PropertyValue) -> std::result::Result<Value, String> {
    match value {
        PropertyValue::Bool(b) => Ok(Value::Bool(*b)),
        PropertyValue::Int(i) => Ok(Value::Number((*i).into())),
        PropertyValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| format!("non-finite float {f}")),
        PropertyValue::String(s) => Ok(Value::String(s.clone())),
        PropertyValue::List(_) => Err("unexpected list".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EntityKind;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn rule(labels: &[&str], index: &str, doc_type: &str) -> MappingRule {
        MappingRule {
            kind: EntityKind::Node,
            match_labels: labels.iter().map(|s| s.to_string()).collect(),
            index: index.into(),
            doc_type: doc_type.into(),
            key_property: "uuid".into(),
            included_properties: None,
            excluded_properties: BTreeSet::new(),
            relationship_policy: None,
        }
    }

    fn change(operation: ChangeOperation, props: Vec<(&str, PropertyValue)>) -> EntityChange {
        EntityChange {
            sequence: 3,
            entity_id: 1,
            key: "abc".into(),
            kind: EntityKind::Node,
            operation,
            labels_before: BTreeSet::new(),
            labels_after: BTreeSet::new(),
            properties_after: props
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn base_props() -> Vec<(&'static str, PropertyValue)> {
        vec![("uuid", "abc".into()), ("name", "Daniela".into()), ("age", 31.into())]
    }

    #[test]
    fn test_fan_out_same_id() {
        let persons = rule(&["Person"], "default-index-node", "persons");
        let girls = rule(&["Female"], "females", "girls");
        let docs = DocumentBuilder::new()
            .build(&change(ChangeOperation::Created, base_props()), &[&persons, &girls], &[])
            .documents;

        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].key, DocKey::new("default-index-node", "persons", "abc"));
        assert_eq!(docs[1].key, DocKey::new("females", "girls", "abc"));
        assert!(docs.iter().all(|d| !d.deleted && d.sequence == 3));
        assert_eq!(docs[0].fields["name"], json!("Daniela"));
        assert_eq!(docs[0].fields["age"], json!(31));
    }

    #[test]
    fn test_duplicate_destinations_collapse() {
        let a = rule(&["Person"], "idx", "people");
        let b = rule(&["Employee"], "idx", "people");
        let docs = DocumentBuilder::new()
            .build(&change(ChangeOperation::Updated, base_props()), &[&a, &b], &[])
            .documents;
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn test_label_change_deletes_lost_destinations() {
        let persons = rule(&["Person"], "default-index-node", "persons");
        let girls = rule(&["Female"], "females", "girls");
        let nodes = rule(&["Node"], "default-index-node", "nodes");

        let docs = DocumentBuilder::new()
            .build(
                &change(ChangeOperation::LabelChanged, base_props()),
                &[&persons, &nodes],
                &[&persons, &girls],
            )
            .documents;

        let upserts: Vec<_> = docs.iter().filter(|d| !d.deleted).map(|d| d.doc_type()).collect();
        let deletes: Vec<_> = docs.iter().filter(|d| d.deleted).map(|d| &d.key).collect();
        assert_eq!(upserts, vec!["persons", "nodes"]);
        assert_eq!(deletes, vec![&DocKey::new("females", "girls", "abc")]);
    }

    #[test]
    fn test_deleted_hits_every_previous_destination() {
        let persons = rule(&["Person"], "default-index-node", "persons");
        let girls = rule(&["Female"], "females", "girls");
        let docs = DocumentBuilder::new()
            .build(&change(ChangeOperation::Deleted, vec![]), &[], &[&persons, &girls])
            .documents;

        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.deleted && d.fields.is_empty()));
    }

    #[test]
    fn test_projection_keeps_key() {
        let mut r = rule(&["Person"], "idx", "people");
        r.included_properties = Some(BTreeSet::from(["name".to_string()]));
        r.excluded_properties = BTreeSet::from(["uuid".to_string()]);

        let docs = DocumentBuilder::new()
            .build(&change(ChangeOperation::Created, base_props()), &[&r], &[])
            .documents;

        let fields = &docs[0].fields;
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["uuid"], json!("abc"));
        assert!(!fields.contains_key("age"));
    }

    #[test]
    fn test_list_order_preserved() {
        let r = rule(&["Node"], "idx", "nodes");
        let mut props = base_props();
        props.push(("types", vec!["a", "b", "c"].into()));

        let docs = DocumentBuilder::new()
            .build(&change(ChangeOperation::Created, props), &[&r], &[])
            .documents;
        assert_eq!(docs[0].fields["types"], json!(["a", "b", "c"]));
    }

    #[test]
    fn test_nested_list_rejected() {
        let r = rule(&["Node"], "idx", "nodes");
        let mut props = base_props();
        props.push(("matrix", PropertyValue::List(vec![vec![1, 2].into()])));

        let built = DocumentBuilder::new().build(&change(ChangeOperation::Created, props), &[&r], &[]);
        assert!(built.documents.is_empty());
        let err = &built.failures[0];
        assert!(matches!(err, ReplicationError::Build { key, .. } if key == "abc"));
        assert!(err.to_string().contains("matrix"));
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let r = rule(&["Node"], "idx", "nodes");
        let mut props = base_props();
        props.push(("score", f64::NAN.into()));

        let built = DocumentBuilder::new().build(&change(ChangeOperation::Updated, props), &[&r], &[]);
        assert!(!built.is_complete());
        assert!(matches!(built.failures[..], [ReplicationError::Build { .. }]));
    }

    #[test]
    fn test_unsupported_value_still_deletes_lost_destinations() {
        let persons = rule(&["Person"], "default-index-node", "persons");
        let girls = rule(&["Female"], "females", "girls");
        let mut props = base_props();
        props.push(("score", f64::NAN.into()));

        let built = DocumentBuilder::new().build(
            &change(ChangeOperation::LabelChanged, props),
            &[&persons],
            &[&persons, &girls],
        );

        let keys: Vec<_> = built.documents.iter().map(|d| (d.key.to_string(), d.deleted)).collect();
        assert_eq!(keys, vec![("females/girls/abc".to_string(), true)]);
        assert_eq!(built.failures.len(), 1);
    }

    #[test]
    fn test_unsupported_value_skips_only_projecting_destinations() {
        let persons = rule(&["Person"], "default-index-node", "persons");
        let mut girls = rule(&["Female"], "females", "girls");
        girls.excluded_properties = BTreeSet::from(["score".to_string()]);
        let mut props = base_props();
        props.push(("score", f64::INFINITY.into()));

        let built = DocumentBuilder::new().build(
            &change(ChangeOperation::Created, props),
            &[&persons, &girls],
            &[],
        );

        assert_eq!(built.documents.len(), 1);
        assert_eq!(built.documents[0].key, DocKey::new("females", "girls", "abc"));
        assert_eq!(built.failures.len(), 1);
    }

    #[test]
    fn test_scalars_pass_through() {
        assert_eq!(to_json(&PropertyValue::Bool(true)).unwrap(), json!(true));
        assert_eq!(to_json(&PropertyValue::Float(1.5)).unwrap(), json!(1.5));
        assert_eq!(to_json(&PropertyValue::Int(-4)).unwrap(), json!(-4));
        assert_eq!(to_json(&vec![1.5, 2.5].into()).unwrap(), json!([1.5, 2.5]));
    }

    #[test]
    fn test_doc_key_display() {
        assert_eq!(DocKey::new("persons", "people", "x1").to_string(), "persons/people/x1");
    }
}
