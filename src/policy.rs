//! Policy engine (spec.md §4.8): signed-policy preflight plus
//! deny-by-default authorization.

use std::path::{Path, PathBuf};

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use crate::canonical;
use crate::error::{Reason, WardenError};
use crate::fsutil;
use crate::keystore::KeyStore;
use crate::model::{Policy, PolicySignature, PolicyState, Proposal};

pub struct PolicyEngine {
    policy_path: PathBuf,
    sig_path: PathBuf,
    state_path: PathBuf,
    strict_mode: bool,
}

/// Outcome of the signed-policy preflight: the policy document, already
/// checked against the signature and monotonicity gates.
pub struct PreflightedPolicy {
    pub policy: Policy,
}

impl PolicyEngine {
    pub fn new(
        policy_path: impl Into<PathBuf>,
        sig_path: impl Into<PathBuf>,
        state_path: impl Into<PathBuf>,
        strict_mode: bool,
    ) -> Self {
        PolicyEngine {
            policy_path: policy_path.into(),
            sig_path: sig_path.into(),
            state_path: state_path.into(),
            strict_mode,
        }
    }

    fn load_policy(&self) -> Result<Policy, WardenError> {
        let bytes = fsutil::read_optional(&self.policy_path)?.ok_or_else(|| WardenError::Io {
            path: self.policy_path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "policy file missing"),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| WardenError::Parse {
            what: "policy.default.json".into(),
            source: e,
        })
    }

    fn load_signature(&self) -> Result<Option<PolicySignature>, WardenError> {
        match fsutil::read_optional(&self.sig_path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| WardenError::Parse {
                    what: "policy.sig.json".into(),
                    source: e,
                }),
            None => Ok(None),
        }
    }

    fn load_state(&self) -> Result<PolicyState, WardenError> {
        match fsutil::read_optional(&self.state_path)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| WardenError::Parse {
                what: "policy.state.json".into(),
                source: e,
            }),
            None => Ok(PolicyState::default()),
        }
    }

    fn save_state(&self, state: &PolicyState) -> Result<(), WardenError> {
        let bytes = serde_json::to_vec(state).map_err(|e| WardenError::Parse {
            what: "policy.state.json".into(),
            source: e,
        })?;
        fsutil::atomic_write(&self.state_path, &bytes)
    }

    /// Verify the detached signature over the policy document, enforce
    /// version/createdAt monotonicity against durable `PolicyState`, and —
    /// on first acceptance of a newer `(version, createdAt)` — persist the
    /// new state atomically.
    pub fn preflight(&self, keystore: &KeyStore) -> Result<PreflightedPolicy, WardenError> {
        let policy = self.load_policy()?;
        let signature = self.load_signature()?;

        match signature {
            None => {
                if self.strict_mode {
                    return Err(Reason::PolicySignatureMissing.into());
                }
            }
            Some(sig) => {
                verify_policy_signature(&policy, &sig, keystore)?;
            }
        }

        fsutil::with_lock(&self.state_path, || {
            let mut state = self.load_state()?;
            if policy.version < state.last_accepted_version {
                return Err(Reason::PolicyVersionRegression.into());
            }
            if policy.created_at < state.last_accepted_created_at {
                return Err(Reason::PolicyCreatedAtRegression.into());
            }
            if policy.version > state.last_accepted_version
                || policy.created_at > state.last_accepted_created_at
            {
                state.last_accepted_version = policy.version;
                state.last_accepted_created_at = policy.created_at;
                self.save_state(&state)?;
            }
            Ok(())
        })?;

        Ok(PreflightedPolicy { policy })
    }

    pub fn policy_path(&self) -> &Path {
        &self.policy_path
    }

    pub fn sig_path(&self) -> &Path {
        &self.sig_path
    }

    /// Read the policy document without verifying its signature or
    /// monotonicity — used by the rate limiter (spec.md §4.7) to look up a
    /// requester's bucket parameters ahead of the policy gate proper
    /// (spec.md §4.11 step 8), which still re-verifies everything before
    /// authorizing.
    pub fn raw_policy(&self) -> Result<Policy, WardenError> {
        self.load_policy()
    }
}

fn verify_policy_signature(
    policy: &Policy,
    sig: &PolicySignature,
    keystore: &KeyStore,
) -> Result<(), WardenError> {
    let key = keystore
        .get(&sig.key_id)
        .ok_or(Reason::PolicySignatureInvalid)?;
    let pk_bytes = base64::engine::general_purpose::STANDARD
        .decode(&key.public_key)
        .map_err(|_| Reason::PolicySignatureInvalid)?;
    let pk_arr: [u8; 32] = pk_bytes
        .try_into()
        .map_err(|_| Reason::PolicySignatureInvalid)?;
    let vk = VerifyingKey::from_bytes(&pk_arr).map_err(|_| Reason::PolicySignatureInvalid)?;

    let canonical = canonical::canonicalize(policy).map_err(|_| Reason::PolicySignatureInvalid)?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&sig.sig)
        .map_err(|_| Reason::PolicySignatureInvalid)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| Reason::PolicySignatureInvalid)?;

    vk.verify(canonical.as_bytes(), &signature)
        .map_err(|_| Reason::PolicySignatureInvalid.into())
}

/// Produce a detached signature over the canonical policy bytes
/// (SPEC_FULL.md §2 — the `policy-sign` command surface as a function).
pub fn sign_policy(
    policy: &Policy,
    key_id: &str,
    signing_key: &ed25519_dalek::SigningKey,
) -> Result<PolicySignature, WardenError> {
    use ed25519_dalek::Signer;
    let canonical = canonical::canonicalize(policy).map_err(|e| WardenError::Parse {
        what: "policy document".into(),
        source: e,
    })?;
    let sig = signing_key.sign(canonical.as_bytes());
    Ok(PolicySignature {
        alg: "ed25519".into(),
        key_id: key_id.into(),
        sig: base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()),
    })
}

/// Authorization, evaluated only after signature verification of the
/// proposal succeeds (spec.md §4.8). Deny is the default.
pub fn authorize(policy: &Policy, proposal: &Proposal) -> Result<(), Reason> {
    let requester = policy
        .requesters
        .get(&proposal.requester_id)
        .ok_or(Reason::RequesterNotAllowed)?;

    let adapter = proposal.adapter().unwrap_or_default();
    if !requester.allow_adapters.contains(adapter) {
        return Err(Reason::AdapterNotAllowed);
    }
    if !requester.allow_commands.contains(&proposal.id) {
        return Err(Reason::CommandNotAllowed);
    }

    if let Some(fs_policy) = &requester.filesystem {
        if let Some(cwd) = proposal.payload.get("cwd").and_then(|v| v.as_str()) {
            let allowed_root = fs_policy.roots.iter().any(|root| cwd.starts_with(root));
            if !fs_policy.roots.is_empty() && !allowed_root {
                return Err(Reason::FilesystemNotAllowed);
            }
            let denied = fs_policy
                .deny_patterns
                .iter()
                .any(|pat| cwd.contains(pat.as_str()));
            if denied {
                return Err(Reason::FilesystemNotAllowed);
            }
        }
    }

    if let Some(exec_policy) = &requester.exec {
        if let Some(cmd) = proposal.payload.get("cmd").and_then(|v| v.as_str()) {
            if exec_policy.deny_cmds.iter().any(|c| c == cmd) {
                return Err(Reason::ExecNotAllowed);
            }
            if !exec_policy.allow_cmds.is_empty()
                && !exec_policy.allow_cmds.iter().any(|c| c == cmd)
            {
                return Err(Reason::ExecNotAllowed);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::KeyStore;
    use crate::model::{
        FilesystemPolicy, RateLimitPolicy, RequesterPolicy, Risk, SecurityPolicy,
        Signature as SigField,
    };
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::collections::{BTreeMap, BTreeSet};

    fn sample_policy(version: i64, created_at: i64) -> Policy {
        let mut requesters = BTreeMap::new();
        requesters.insert(
            "agent:gpt".to_string(),
            RequesterPolicy {
                allow_adapters: BTreeSet::from(["noop".to_string()]),
                allow_commands: BTreeSet::from(["RUN_SHELL".to_string()]),
                filesystem: Some(FilesystemPolicy {
                    roots: vec!["/srv/app".into()],
                    deny_patterns: vec![],
                }),
                exec: None,
                rate_limit: None,
            },
        );
        Policy {
            version,
            created_at,
            default: crate::model::PolicyDefault::Deny,
            requesters,
            security: SecurityPolicy {
                clock_skew_tolerance_secs: 300,
                default_rate_limit: RateLimitPolicy {
                    capacity: 10.0,
                    refill_per_second: 1.0,
                },
            },
        }
    }

    fn sample_proposal(requester: &str, id: &str, adapter: &str) -> Proposal {
        Proposal {
            id: id.into(),
            command_id: "c1".into(),
            requester_id: requester.into(),
            session_id: "s1".into(),
            timestamp: 1000,
            nonce: "a".repeat(64),
            requires: vec![],
            risk: Risk::Low,
            payload: serde_json::json!({"adapter": adapter}),
            signature: SigField {
                alg: "ed25519".into(),
                key_id: "k1".into(),
                sig: String::new(),
            },
        }
    }

    #[test]
    fn unknown_requester_is_denied_by_default() {
        let policy = sample_policy(1, 1000);
        let proposal = sample_proposal("agent:unknown", "RUN_SHELL", "noop");
        assert_eq!(authorize(&policy, &proposal).unwrap_err(), Reason::RequesterNotAllowed);
    }

    #[test]
    fn disallowed_adapter_is_denied() {
        let policy = sample_policy(1, 1000);
        let proposal = sample_proposal("agent:gpt", "RUN_SHELL", "shell");
        assert_eq!(authorize(&policy, &proposal).unwrap_err(), Reason::AdapterNotAllowed);
    }

    #[test]
    fn disallowed_command_is_denied() {
        let policy = sample_policy(1, 1000);
        let proposal = sample_proposal("agent:gpt", "DELETE_ALL", "noop");
        assert_eq!(authorize(&policy, &proposal).unwrap_err(), Reason::CommandNotAllowed);
    }

    #[test]
    fn allowed_combination_passes() {
        let policy = sample_policy(1, 1000);
        let proposal = sample_proposal("agent:gpt", "RUN_SHELL", "noop");
        assert!(authorize(&policy, &proposal).is_ok());
    }

    #[test]
    fn filesystem_root_outside_allowlist_is_denied() {
        let policy = sample_policy(1, 1000);
        let mut proposal = sample_proposal("agent:gpt", "RUN_SHELL", "noop");
        proposal.payload = serde_json::json!({"adapter": "noop", "cwd": "/etc"});
        assert_eq!(
            authorize(&policy, &proposal).unwrap_err(),
            Reason::FilesystemNotAllowed
        );
    }

    #[test]
    fn policy_signature_verifies_against_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let sk = SigningKey::generate(&mut OsRng);
        let pk_b64 = base64::engine::general_purpose::STANDARD.encode(sk.verifying_key().as_bytes());
        let keystore = KeyStore::from_keys(vec![crate::model::TrustedKey {
            key_id: "policy-signer".into(),
            public_key: pk_b64,
            not_before: 0,
            expires_at: 10_000_000_000,
            trusted_requesters: None,
        }])
        .unwrap();

        let policy = sample_policy(1, 1000);
        let sig = sign_policy(&policy, "policy-signer", &sk).unwrap();

        std::fs::write(
            dir.path().join("policy.json"),
            serde_json::to_vec(&policy).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("policy.sig.json"), serde_json::to_vec(&sig).unwrap())
            .unwrap();

        let engine = PolicyEngine::new(
            dir.path().join("policy.json"),
            dir.path().join("policy.sig.json"),
            dir.path().join("policy.state.json"),
            true,
        );
        assert!(engine.preflight(&keystore).is_ok());
    }

    #[test]
    fn missing_signature_in_strict_mode_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let policy = sample_policy(1, 1000);
        std::fs::write(
            dir.path().join("policy.json"),
            serde_json::to_vec(&policy).unwrap(),
        )
        .unwrap();

        let keystore = KeyStore::from_keys(vec![]).unwrap();
        let engine = PolicyEngine::new(
            dir.path().join("policy.json"),
            dir.path().join("policy.sig.json"),
            dir.path().join("policy.state.json"),
            true,
        );
        assert_eq!(
            engine.preflight(&keystore).unwrap_err().as_reason(),
            Some(Reason::PolicySignatureMissing)
        );
    }

    #[test]
    fn version_regression_is_rejected_after_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let sk = SigningKey::generate(&mut OsRng);
        let pk_b64 = base64::engine::general_purpose::STANDARD.encode(sk.verifying_key().as_bytes());
        let keystore = KeyStore::from_keys(vec![crate::model::TrustedKey {
            key_id: "policy-signer".into(),
            public_key: pk_b64,
            not_before: 0,
            expires_at: 10_000_000_000,
            trusted_requesters: None,
        }])
        .unwrap();

        let engine = PolicyEngine::new(
            dir.path().join("policy.json"),
            dir.path().join("policy.sig.json"),
            dir.path().join("policy.state.json"),
            true,
        );

        let v2 = sample_policy(2, 2000);
        let sig2 = sign_policy(&v2, "policy-signer", &sk).unwrap();
        std::fs::write(dir.path().join("policy.json"), serde_json::to_vec(&v2).unwrap()).unwrap();
        std::fs::write(
            dir.path().join("policy.sig.json"),
            serde_json::to_vec(&sig2).unwrap(),
        )
        .unwrap();
        engine.preflight(&keystore).unwrap();

        let v1 = sample_policy(1, 1500);
        let sig1 = sign_policy(&v1, "policy-signer", &sk).unwrap();
        std::fs::write(dir.path().join("policy.json"), serde_json::to_vec(&v1).unwrap()).unwrap();
        std::fs::write(
            dir.path().join("policy.sig.json"),
            serde_json::to_vec(&sig1).unwrap(),
        )
        .unwrap();
        assert_eq!(
            engine.preflight(&keystore).unwrap_err().as_reason(),
            Some(Reason::PolicyVersionRegression)
        );
    }
}
