//! Fuzz target for property value conversion.
//!
//! Any value a host can hand over must convert to a document field or be
//! rejected, never panic. Accepted lists keep their length.

#![no_main]

use graph_index_replicator::document::to_json;
use graph_index_replicator::PropertyValue;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let Ok(value) = serde_json::from_str::<PropertyValue>(data) else {
        return;
    };

    match (&value, to_json(&value)) {
        (PropertyValue::List(items), Ok(serde_json::Value::Array(converted))) => {
            assert_eq!(items.len(), converted.len());
        }
        (PropertyValue::List(_), Ok(other)) => panic!("list converted to {other}"),
        (PropertyValue::Float(f), Ok(_)) => assert!(f.is_finite()),
        _ => {}
    }
});
