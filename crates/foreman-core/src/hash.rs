// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value with recursively lexicographically sorted object
/// keys. Array order is preserved. This is the canonical form hashed into
/// `source_hash`, so the output must be bit-identical for logically
/// equivalent values regardless of the key order they arrived in.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Keys and scalars go through serde_json so string escaping
                // and number formatting stay identical to plain serialization.
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotency hash of a raw host event: SHA-256 over the canonical JSON of
/// `{"properties": ..., "type": ...}`.
pub fn event_source_hash(event_type: &str, properties: &Value) -> String {
    let envelope = serde_json::json!({
        "type": event_type,
        "properties": properties,
    });
    value_hash(&envelope)
}

/// SHA-256 over the canonical form of an arbitrary JSON value.
pub fn value_hash(value: &Value) -> String {
    sha256_hex(&canonical_json(value))
}

/// SHA-256 of a plain text payload (content hashes).
pub fn text_hash(text: &str) -> String {
    sha256_hex(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_keys_are_sorted_recursively() {
        let v = json!({"b": {"z": 1, "a": 2}, "a": true});
        assert_eq!(canonical_json(&v), r#"{"a":true,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn array_order_is_preserved() {
        let v = json!({"list": [3, 1, 2]});
        assert_eq!(canonical_json(&v), r#"{"list":[3,1,2]}"#);
    }

    #[test]
    fn arrays_of_objects_sort_inner_keys_only() {
        let v = json!([{"b": 1, "a": 2}, {"d": 3, "c": 4}]);
        assert_eq!(canonical_json(&v), r#"[{"a":2,"b":1},{"c":4,"d":3}]"#);
    }

    #[test]
    fn string_escaping_matches_serde() {
        let v = json!({"msg": "line\nbreak \"quoted\""});
        assert_eq!(
            canonical_json(&v),
            r#"{"msg":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn equivalent_events_hash_identically() {
        // Same logical properties, different key order at two nesting levels.
        let a = json!({"part": {"type": "tool", "sessionID": "s1"}, "extra": 1});
        let b = json!({"extra": 1, "part": {"sessionID": "s1", "type": "tool"}});
        assert_eq!(
            event_source_hash("message.part.updated", &a),
            event_source_hash("message.part.updated", &b),
        );
    }

    #[test]
    fn different_event_types_hash_differently() {
        let props = json!({"info": {"id": "s1"}});
        assert_ne!(
            event_source_hash("session.created", &props),
            event_source_hash("session.deleted", &props),
        );
    }

    #[test]
    fn hash_is_64_hex_chars() {
        let h = event_source_hash("session.idle", &json!({}));
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn text_hash_is_stable() {
        assert_eq!(text_hash("same"), text_hash("same"));
        assert_ne!(text_hash("same"), text_hash("other"));
    }
}
