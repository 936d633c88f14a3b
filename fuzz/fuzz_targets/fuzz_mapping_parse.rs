//! Fuzz target for mapping document parsing.
//!
//! Arbitrary input must either compile into a mapping or be rejected with a
//! configuration error, never panic. Compiled mappings must resolve any
//! label set to at least one rule.

#![no_main]

use graph_index_replicator::mapping::{JsonFileMapping, Mapping};
use graph_index_replicator::EntityKind;
use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;

fuzz_target!(|data: (&str, Vec<String>)| {
    let (raw, labels) = data;

    let Ok(mapping) = JsonFileMapping::from_json_str(raw, "fuzz") else {
        return;
    };

    let labels: BTreeSet<String> = labels.into_iter().collect();
    for kind in [EntityKind::Node, EntityKind::Relationship] {
        let rules = mapping.resolve(&labels, kind);
        assert!(!rules.is_empty());
        assert!(rules.iter().all(|r| r.kind == kind));
    }

    if let Some(rel_type) = labels.iter().next() {
        let _ = mapping.includes_relationship(rel_type);
    }
});
