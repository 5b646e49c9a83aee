//! Canonical JSON and SHA-256 digests.
//!
//! Decisions and event ids are hashed over canonical JSON: object keys
//! sorted by UTF-16 code units, compact separators, array order preserved.

use sha2::{Digest, Sha256};

/// Recursively sort JSON object keys using UTF-16 code unit ordering.
fn sort_keys_utf16(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| a.encode_utf16().cmp(b.encode_utf16()));

            let mut sorted = serde_json::Map::new();
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), sort_keys_utf16(v));
                }
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(sort_keys_utf16).collect())
        }
        other => other.clone(),
    }
}

/// Canonical compact JSON text for `value`.
pub fn canonical_json(value: &serde_json::Value) -> String {
    sort_keys_utf16(value).to_string()
}

/// SHA-256 of raw bytes, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical JSON form of `value`.
pub fn compute_digest(value: &serde_json::Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_field_order_invariant() {
        let a = serde_json::json!({ "b": 1, "a": { "z": 1, "y": 2 } });
        let b = serde_json::json!({ "a": { "y": 2, "z": 1 }, "b": 1 });
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn test_canonical_json_array_order_preserved() {
        let a = serde_json::json!({ "jobs": ["build", "deploy"] });
        let b = serde_json::json!({ "jobs": ["deploy", "build"] });
        assert_ne!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_compute_digest_single_field_delta() {
        let a = compute_digest(&serde_json::json!({ "event_id": "evt-1" }));
        let b = compute_digest(&serde_json::json!({ "event_id": "evt-2" }));
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
