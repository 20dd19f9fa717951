//! Canonical JSON serialization for signing and hashing (spec.md §4.1).
//!
//! Rules: UTF-8, no insignificant whitespace, object keys sorted in
//! code-point order, arrays preserve order, numbers and strings delegated to
//! `serde_json`'s own (already minimal, already `\uXXXX`-escaping) encoding.
//! Callers that need the proposal's signing bytes are responsible for
//! stripping the `signature` field from the value first — this module never
//! special-cases any field name.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Canonicalize any serializable value into its deterministic byte string.
pub fn canonicalize<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    canonicalize_value(&v)
}

fn canonicalize_value(value: &serde_json::Value) -> Result<String, serde_json::Error> {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);

            let mut result = String::from("{");
            for (i, (k, v)) in pairs.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&serde_json::to_string(k)?);
                result.push(':');
                result.push_str(&canonicalize_value(v)?);
            }
            result.push('}');
            Ok(result)
        }
        serde_json::Value::Array(arr) => {
            let mut result = String::from("[");
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    result.push(',');
                }
                result.push_str(&canonicalize_value(v)?);
            }
            result.push(']');
            Ok(result)
        }
        _ => serde_json::to_string(value),
    }
}

/// Canonicalize, then strip the named top-level field before producing
/// bytes. Used for the proposal's `signature` field (§4.1 invariant: the
/// signature is never part of the signed bytes) and, identically, for an
/// audit entry's own `hash` field (§4.10).
pub fn canonicalize_without_field<T: Serialize>(
    value: &T,
    field: &str,
) -> Result<String, serde_json::Error> {
    let mut v = serde_json::to_value(value)?;
    if let serde_json::Value::Object(map) = &mut v {
        map.remove(field);
    }
    canonicalize_value(&v)
}

/// SHA-256 of the canonical bytes, hex-encoded.
pub fn hash_canonical<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(canonicalize(value)?.as_bytes()))
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
