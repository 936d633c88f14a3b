// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change extraction: committed transaction diff → ordered entity changes.
//!
//! Each touched entity yields at most one [`EntityChange`] per commit. When
//! the host reports the same entity several times, the first `before` and the
//! last `after` snapshot are kept and the change stays at its first position.
//!
//! | before | after | labels differ | properties differ | change |
//! |--------|-------|---------------|-------------------|--------|
//! | None | None | - | - | nothing |
//! | Some | None | - | - | `Deleted` |
//! | None | Some | - | - | `Created` |
//! | Some | Some | yes | - | `LabelChanged` |
//! | Some | Some | no | yes | `Updated` |
//! | Some | Some | no | no | nothing |
//!
//! A change of the key property itself is emitted as `Deleted` for the old key
//! followed by `Created` for the new one, so no document survives under a key
//! the entity no longer has. Losing the key (removed, emptied or no longer a
//! string) emits `Deleted` for the old key plus an extraction error.

use crate::error::{ReplicationError, Result};
use crate::graph::{EntityKind, EntitySnapshot, PropertyValue, TransactionData};
use crate::mapping::Mapping;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::trace;

/// What happened to an entity in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    Created,
    Updated,
    Deleted,
    LabelChanged,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Created => "created",
            ChangeOperation::Updated => "updated",
            ChangeOperation::Deleted => "deleted",
            ChangeOperation::LabelChanged => "label_changed",
        }
    }
}

/// One entity's net change within one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    /// Commit that produced this change.
    pub sequence: u64,
    pub entity_id: u64,
    /// Value of the key property; becomes the document id.
    pub key: String,
    pub kind: EntityKind,
    pub operation: ChangeOperation,
    pub labels_before: BTreeSet<String>,
    pub labels_after: BTreeSet<String>,
    /// Empty for `Deleted`.
    pub properties_after: BTreeMap<String, PropertyValue>,
}

impl EntityChange {
    /// Identifier used in logs (`node:42`).
    pub fn entity_ref(&self) -> String {
        format!("{}:{}", self.kind, self.entity_id)
    }

    pub fn is_delete(&self) -> bool {
        self.operation == ChangeOperation::Deleted
    }
}

/// Turns commits into entity changes using the mapping's key property and
/// relationship policy.
pub struct ChangeExtractor {
    mapping: Arc<dyn Mapping>,
}

impl ChangeExtractor {
    pub fn new(mapping: Arc<dyn Mapping>) -> Self {
        Self { mapping }
    }

    /// Extract the changes of one commit, in first-touched order.
    ///
    /// A malformed entity yields an `Err` in its slot; the other entities of
    /// the commit are unaffected.
    pub fn extract(&self, tx: &TransactionData) -> Vec<Result<EntityChange>> {
        let mut order: Vec<(EntityKind, u64)> = Vec::new();
        let mut merged: HashMap<(EntityKind, u64), (Option<&EntitySnapshot>, Option<&EntitySnapshot>)> =
            HashMap::new();

        for diff in &tx.diffs {
            let id = (diff.kind, diff.id);
            match merged.get_mut(&id) {
                Some(entry) => entry.1 = diff.after.as_ref(),
                None => {
                    order.push(id);
                    merged.insert(id, (diff.before.as_ref(), diff.after.as_ref()));
                }
            }
        }

        let mut out = Vec::with_capacity(order.len());
        for (kind, id) in order {
            let Some(&(before, after)) = merged.get(&(kind, id)) else {
                continue;
            };
            self.extract_entity(tx.sequence, kind, id, before, after, &mut out);
        }

        trace!(tx = tx.sequence, diffs = tx.diffs.len(), changes = out.len(), "Extracted commit");
        out
    }

    fn extract_entity(
        &self,
        sequence: u64,
        kind: EntityKind,
        entity_id: u64,
        before: Option<&EntitySnapshot>,
        after: Option<&EntitySnapshot>,
        out: &mut Vec<Result<EntityChange>>,
    ) {
        let entity = format!("{kind}:{entity_id}");

        // Relationship policy is decided on the most recent type we know.
        if kind == EntityKind::Relationship {
            let Some(snapshot) = after.or(before) else {
                return;
            };
            match relationship_type(snapshot) {
                Some(rel_type) => {
                    if !self.mapping.includes_relationship(rel_type) {
                        trace!(entity = %entity, rel_type, "Relationship type not replicated");
                        return;
                    }
                }
                None => {
                    out.push(Err(ReplicationError::extraction(entity, "relationship has no type")));
                    return;
                }
            }
        }

        let change = |operation, key: String, before: Option<&EntitySnapshot>, after: Option<&EntitySnapshot>| {
            EntityChange {
                sequence,
                entity_id,
                key,
                kind,
                operation,
                labels_before: before.map(|s| s.labels.clone()).unwrap_or_default(),
                labels_after: after.map(|s| s.labels.clone()).unwrap_or_default(),
                properties_after: after.map(|s| s.properties.clone()).unwrap_or_default(),
            }
        };

        match (before, after) {
            (None, None) => {}
            (Some(before), None) => match self.key_of(&entity, before) {
                Ok(key) => out.push(Ok(change(ChangeOperation::Deleted, key, Some(before), None))),
                Err(e) => out.push(Err(e)),
            },
            (None, Some(after)) => match self.key_of(&entity, after) {
                Ok(key) => out.push(Ok(change(ChangeOperation::Created, key, None, Some(after)))),
                Err(e) => out.push(Err(e)),
            },
            (Some(before), Some(after)) => {
                let new_key = match self.key_of(&entity, after) {
                    Ok(key) => key,
                    Err(e) => {
                        // The entity can no longer be indexed; retract what the old key holds
                        if let Ok(old_key) = self.key_of(&entity, before) {
                            out.push(Ok(change(ChangeOperation::Deleted, old_key, Some(before), None)));
                        }
                        out.push(Err(e));
                        return;
                    }
                };

                // Old documents live under the old key
                if let Ok(old_key) = self.key_of(&entity, before) {
                    if old_key != new_key {
                        out.push(Ok(change(ChangeOperation::Deleted, old_key, Some(before), None)));
                        out.push(Ok(change(ChangeOperation::Created, new_key, None, Some(after))));
                        return;
                    }
                }

                if before.labels != after.labels {
                    out.push(Ok(change(ChangeOperation::LabelChanged, new_key, Some(before), Some(after))));
                } else if before.properties != after.properties {
                    out.push(Ok(change(ChangeOperation::Updated, new_key, Some(before), Some(after))));
                }
            }
        }
    }

    fn key_of(&self, entity: &str, snapshot: &EntitySnapshot) -> Result<String> {
        let key_property = self.mapping.key_property();
        match snapshot.property(key_property) {
            Some(PropertyValue::String(key)) if !key.is_empty() => Ok(key.clone()),
            Some(PropertyValue::String(_)) => Err(ReplicationError::extraction(
                entity,
                format!("empty key property '{key_property}'"),
            )),
            Some(_) => Err(ReplicationError::extraction(
                entity,
                format!("key property '{key_property}' is not a string"),
            )),
            None => Err(ReplicationError::extraction(
                entity,
                format!("missing key property '{key_property}'"),
            )),
        }
    }
}

fn relationship_type(snapshot: &EntitySnapshot) -> Option<&str> {
    snapshot.labels.iter().next().map(String::as_str)
}
