//! Ambient configuration (SPEC_FULL.md §1). Plain-JSON, matching the rest
//! of the crate's file formats — no `toml`, no env-var parsing framework.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_skew() -> i64 {
    300
}

fn default_strict() -> bool {
    true
}

fn default_max_bytes() -> usize {
    1_048_576
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WardenConfig {
    pub policy_path: PathBuf,
    pub policy_sig_path: PathBuf,
    pub keys_path: PathBuf,
    pub integrity_manifest_path: PathBuf,
    pub nonce_store_path: PathBuf,
    pub rate_limit_store_path: PathBuf,
    pub policy_state_path: PathBuf,
    pub audit_log_path: PathBuf,

    #[serde(default = "default_skew")]
    pub skew_tolerance_secs: i64,
    #[serde(default = "default_strict")]
    pub strict_mode: bool,
    #[serde(default = "default_max_bytes")]
    pub max_proposal_bytes: usize,
}

impl WardenConfig {
    /// Lay the eight files (spec.md §6) out under a single root, the
    /// conventional shape for a local deployment: `config/*.json` for the
    /// read-only inputs, `data/*.json(l)` for the durable stores.
    pub fn under_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        WardenConfig {
            policy_path: root.join("config/policy.default.json"),
            policy_sig_path: root.join("config/policy.sig.json"),
            keys_path: root.join("config/keys.json"),
            integrity_manifest_path: root.join("config/integrity.manifest.json"),
            nonce_store_path: root.join("data/nonce.db.json"),
            rate_limit_store_path: root.join("data/rate-limit.db.json"),
            policy_state_path: root.join("data/policy.state.json"),
            audit_log_path: root.join("data/audit.log.jsonl"),
            skew_tolerance_secs: default_skew(),
            strict_mode: default_strict(),
            max_proposal_bytes: default_max_bytes(),
        }
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
