//! Content hashing of worker specifications
//!
//! The hash is the SHA-256 of a canonical JSON encoding (object keys sorted
//! at every level, no insignificant whitespace). Two specs that differ only
//! in map iteration order hash identically.

use aws_lc_rs::digest::{digest, SHA256};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::Error;

/// Hex SHA-256 of the canonical JSON encoding of `object`
pub fn content_hash<T: Serialize>(object: &T) -> Result<String, Error> {
    let value = serde_json::to_value(object)?;
    let canonical = serde_json::to_vec(&canonicalize(value))?;
    let hash = digest(&SHA256, &canonical);
    Ok(hash.as_ref().iter().map(|b| format!("{:02x}", b)).collect())
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
