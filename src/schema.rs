//! Schema validator (spec.md §4.4). Runs on the raw JSON value, before any
//! attempt to deserialize into `Proposal`, so we control exactly which rule
//! is reported first and can reject unknown fields strictly.

use serde_json::Value;

use crate::error::Reason;
use crate::model::Proposal;

const ALLOWED_TOP_LEVEL: &[&str] = &[
    "id",
    "commandId",
    "requesterId",
    "sessionId",
    "timestamp",
    "nonce",
    "requires",
    "risk",
    "payload",
    "signature",
];

fn is_hex_nonce(s: &str) -> bool {
    s.len() >= 32 && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

fn require_string<'a>(obj: &'a serde_json::Map<String, Value>, field: &str) -> Result<&'a str, Reason> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or(Reason::SchemaError)
}

/// Validate structure, then parse. Returns the first violated rule, in the
/// order the fields are listed in spec.md §3.
pub fn validate_and_parse(raw: &Value) -> Result<Proposal, Reason> {
    let obj = raw.as_object().ok_or(Reason::SchemaError)?;

    for key in obj.keys() {
        if !ALLOWED_TOP_LEVEL.contains(&key.as_str()) {
            return Err(Reason::SchemaError);
        }
    }

    require_string(obj, "id")?;
    require_string(obj, "commandId")?;
    require_string(obj, "requesterId")?;
    require_string(obj, "sessionId")?;

    let timestamp = obj.get("timestamp").ok_or(Reason::SchemaError)?;
    if !timestamp.is_i64() && !timestamp.is_u64() {
        return Err(Reason::SchemaError);
    }

    let nonce = require_string(obj, "nonce")?;
    if !is_hex_nonce(nonce) {
        return Err(Reason::SchemaError);
    }

    if let Some(requires) = obj.get("requires") {
        let arr = requires.as_array().ok_or(Reason::SchemaError)?;
        if !arr.iter().all(|v| v.is_string()) {
            return Err(Reason::SchemaError);
        }
    }

    let risk = require_string(obj, "risk")?;
    if !matches!(risk, "LOW" | "MEDIUM" | "HIGH" | "CRITICAL") {
        return Err(Reason::SchemaError);
    }

    let payload = obj.get("payload").ok_or(Reason::SchemaError)?;
    let payload_obj = payload.as_object().ok_or(Reason::SchemaError)?;
    if payload_obj.is_empty() {
        return Err(Reason::SchemaError);
    }

    let signature = obj.get("signature").ok_or(Reason::SchemaError)?;
    let sig_obj = signature.as_object().ok_or(Reason::SchemaError)?;
    require_string(sig_obj, "alg")?;
    require_string(sig_obj, "keyId")?;
    require_string(sig_obj, "sig")?;

    serde_json::from_value(raw.clone()).map_err(|_| Reason::SchemaError)
}
