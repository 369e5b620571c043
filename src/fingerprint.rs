//! Request fingerprinting and idempotency-key derivation.
//!
//! Canonical form: object keys sorted recursively, array order kept, compact
//! serialization with no insignificant whitespace. Two bodies that differ only
//! in key order or formatting therefore share a fingerprint.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub const FINGERPRINT_PREFIX: &str = "sha256:";
pub const DERIVED_KEY_PREFIX: &str = "body:";

/// Serializes `value` in canonical form.
pub fn canonical_json(value: &Value) -> String {
    // Independent of serde_json's `preserve_order` feature.
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
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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

/// Digest of the canonical form of a JSON payload.
pub fn fingerprint(payload: &Value) -> String {
    let digest = Sha256::digest(canonical_json(payload).as_bytes());
    format!("{}{}", FINGERPRINT_PREFIX, hex::encode(digest))
}

/// Picks the idempotency key for a request.
///
/// Precedence: explicit header key, then the payload field at `key_field`
/// (a JSON pointer such as `/name`), then a key derived from the fingerprint.
pub fn derive_key(
    header_key: Option<String>,
    payload: &Value,
    key_field: Option<&str>,
    fingerprint: &str,
) -> String {
    if let Some(key) = header_key {
        return key;
    }

    let from_field = key_field
        .and_then(|pointer| payload.pointer(pointer))
        .and_then(|field| match field {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    from_field.unwrap_or_else(|| format!("{}{}", DERIVED_KEY_PREFIX, fingerprint))
}
