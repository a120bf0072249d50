//! Deterministic SHA-256 fingerprints for files, nodes, and query shapes.
//!
//! All identity in the engine is content-addressed: parsed artifacts,
//! embeddings, and query results key off these digests so incremental work
//! is cheap and repeatable.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable node identifier:
/// `SHA256(file_path || "\0" || kind || "\0" || normalized_shape || "\0" || byte_offset)`.
///
/// `normalized_shape` is the node kind followed by child kinds in order,
/// with whitespace and comments excluded by the caller.
pub fn node_id(
    file_path: &str,
    kind: &str,
    normalized_shape: &str,
    byte_offset: usize,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_shape.as_bytes());
    hasher.update([0u8]);
    hasher.update(byte_offset.to_string().as_bytes());
    hex_encode(&hasher.finalize())
}

/// Cache key for a query shape:
/// `"query:" || kind || ":" || hex16(SHA256(kind || "|" || text || "|" || canonical_json(options) || "|" || index_version))`.
pub fn query_key(query_kind: &str, query_text: &str, options: &Value, index_version: u64) -> String {
    let canonical = canonical_json(options);
    let mut hasher = Sha256::new();
    hasher.update(query_kind.as_bytes());
    hasher.update(b"|");
    hasher.update(query_text.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical.as_bytes());
    hasher.update(b"|");
    hasher.update(index_version.to_string().as_bytes());
    let digest = hex_encode(&hasher.finalize());
    format!("query:{}:{}", query_kind, &digest[..16])
}

/// Content fingerprint of a source file; identical bytes always produce the
/// same digest, which is how the parse coordinator skips unchanged files.
pub fn file_fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// Digest of a grammar blob, compared against the recorded value before the
/// grammar is loaded.
pub fn grammar_digest(bytes: &[u8]) -> String {
    file_fingerprint(bytes)
}

/// JSON serialization with object keys sorted recursively, so two maps with
/// the same entries always fingerprint identically.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_id_is_deterministic() {
        let a = node_id("src/lib.rs", "function", "function(identifier,parameters,block)", 42);
        let b = node_id("src/lib.rs", "function", "function(identifier,parameters,block)", 42);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn node_id_varies_with_each_input() {
        let base = node_id("a.rs", "function", "shape", 0);
        assert_ne!(base, node_id("b.rs", "function", "shape", 0));
        assert_ne!(base, node_id("a.rs", "method", "shape", 0));
        assert_ne!(base, node_id("a.rs", "function", "other", 0));
        assert_ne!(base, node_id("a.rs", "function", "shape", 1));
    }

    #[test]
    fn separator_prevents_field_bleed() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(
            node_id("ab", "c", "s", 0),
            node_id("a", "bc", "s", 0)
        );
    }

    #[test]
    fn query_key_shape() {
        let key = query_key("semantic", "find auth", &json!({"top_k": 5}), 3);
        assert!(key.starts_with("query:semantic:"));
        let digest = key.rsplit(':').next().unwrap();
        assert_eq!(digest.len(), 16);
    }

    #[test]
    fn query_key_ignores_option_key_order() {
        let a = query_key("semantic", "q", &json!({"a": 1, "b": 2}), 1);
        let b = query_key("semantic", "q", &json!({"b": 2, "a": 1}), 1);
        assert_eq!(a, b);
    }

    #[test]
    fn query_key_varies_with_index_version() {
        let a = query_key("semantic", "q", &json!({}), 1);
        let b = query_key("semantic", "q", &json!({}), 2);
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let v = json!({"z": {"b": 1, "a": 2}, "a": [3, {"y": 1, "x": 2}]});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[3,{"x":2,"y":1}],"z":{"a":2,"b":1}}"#
        );
    }
}
