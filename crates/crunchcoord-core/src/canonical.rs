// Copyright (c) 2026 Crunchcoord Contributors
// SPDX-License-Identifier: Apache-2.0

//! Canonical encoding for hash-committed payloads.
//!
//! Sorted-key JSON with no whitespace, so any implementation can reproduce
//! the same digest from the same snapshot fields.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{CoordError, CoordResult};

/// Render a timestamp the way every hash-committed payload renders it.
pub fn ts_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Serialize with object keys sorted at every level and minimal separators.
pub fn canonical_json(v: &impl Serialize) -> CoordResult<Vec<u8>> {
    let value = serde_json::to_value(v).map_err(|_| CoordError::Encoding)?;
    let sorted = sort_json(value);
    serde_json::to_vec(&sorted).map_err(|_| CoordError::Encoding)
}

fn sort_json(v: Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, val) in entries {
                sorted.insert(k, sort_json(val));
            }
            Value::Object(sorted)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

/// Deterministic content hash of a snapshot. This is the Merkle leaf.
pub fn snapshot_content_hash(
    model_id: &str,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    prediction_count: u64,
    result_summary: &Map<String, Value>,
) -> CoordResult<String> {
    let payload = json!({
        "model_id": model_id,
        "period_start": ts_rfc3339(period_start),
        "period_end": ts_rfc3339(period_end),
        "prediction_count": prediction_count,
        "result_summary": result_summary,
    });
    let encoded = canonical_json(&payload)?;
    Ok(sha256_hex(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": [{"y": 1, "x": 2}]});
        let encoded = canonical_json(&v).unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"a":[{"x":2,"y":1}],"b":{"a":2,"z":1}}"#
        );
    }

    #[test]
    fn snapshot_hash_is_stable_and_field_sensitive() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 1, 0, 1, 0).unwrap();
        let mut summary = Map::new();
        summary.insert("value".to_string(), json!(0.42));

        let h1 = snapshot_content_hash("model-a", start, end, 10, &summary).unwrap();
        let h2 = snapshot_content_hash("model-a", start, end, 10, &summary).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);

        summary.insert("value".to_string(), json!(0.43));
        let h3 = snapshot_content_hash("model-a", start, end, 10, &summary).unwrap();
        assert_ne!(h1, h3);

        let h4 = snapshot_content_hash("model-b", start, end, 10, &summary).unwrap();
        assert_ne!(h3, h4);
    }
}
