//! Data model (spec.md §3).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Risk {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    pub alg: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
    pub sig: String,
}

/// The signed envelope. Field order here is documentation only — signing
/// bytes always go through `canonical::canonicalize_without_field`, never
/// struct field order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    #[serde(rename = "requesterId")]
    pub requester_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub timestamp: i64,
    pub nonce: String,
    #[serde(default)]
    pub requires: Vec<String>,
    pub risk: Risk,
    pub payload: serde_json::Value,
    pub signature: Signature,
}

impl Proposal {
    /// `payload.adapter`, the one payload field the controller itself reads
    /// (everything else in `payload` is adapter-specific and opaque to us).
    pub fn adapter(&self) -> Option<&str> {
        self.payload.get("adapter").and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustedKey {
    #[serde(rename = "keyId")]
    pub key_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "notBefore")]
    pub not_before: i64,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(rename = "trustedRequesters", skip_serializing_if = "Option::is_none")]
    pub trusted_requesters: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub keys: Vec<TrustedKey>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemPolicy {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roots: Vec<String>,
    #[serde(rename = "denyPatterns", default, skip_serializing_if = "Vec::is_empty")]
    pub deny_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecPolicy {
    #[serde(rename = "allowCmds", default, skip_serializing_if = "Vec::is_empty")]
    pub allow_cmds: Vec<String>,
    #[serde(rename = "denyCmds", default, skip_serializing_if = "Vec::is_empty")]
    pub deny_cmds: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Bucket capacity (tokens).
    pub capacity: f64,
    /// Refill rate, tokens per second.
    #[serde(rename = "refillPerSecond")]
    pub refill_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequesterPolicy {
    #[serde(rename = "allowAdapters")]
    pub allow_adapters: BTreeSet<String>,
    #[serde(rename = "allowCommands")]
    pub allow_commands: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FilesystemPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecPolicy>,
    #[serde(rename = "rateLimit", default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    #[serde(rename = "clockSkewToleranceSecs")]
    pub clock_skew_tolerance_secs: i64,
    #[serde(rename = "defaultRateLimit")]
    pub default_rate_limit: RateLimitPolicy,
}

/// `default` is always `"DENY"` (spec.md §3); kept as a field rather than
/// omitted so the on-disk document is self-documenting and a hand-edited
/// `"ALLOW"` is rejected at load time instead of silently ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub version: i64,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub default: PolicyDefault,
    pub requesters: BTreeMap<String, RequesterPolicy>,
    pub security: SecurityPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyDefault {
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySignature {
    pub alg: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
    pub sig: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PolicyState {
    #[serde(rename = "lastAcceptedVersion")]
    pub last_accepted_version: i64,
    #[serde(rename = "lastAcceptedCreatedAt")]
    pub last_accepted_created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NonceEntry {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub nonce: String,
    #[serde(rename = "firstSeenAt")]
    pub first_seen_at: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NonceFile {
    pub entries: Vec<NonceEntry>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBucket {
    pub tokens: f64,
    #[serde(rename = "lastRefillAt")]
    pub last_refill_at: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitFile {
    pub buckets: BTreeMap<String, TokenBucket>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<bool>,
    #[serde(rename = "keyId", skip_serializing_if = "Option::is_none")]
    pub key_id: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub valid: bool,
    pub checks: Checks,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::Reason>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<crate::error::Reason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<Checks>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
    #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "prevHash")]
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFileEntry {
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub files: Vec<ManifestFileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<PolicySignature>,
}
