//! Validation pipeline (spec.md §4.11): the fixed-order composition of
//! every gate, each short-circuiting on failure. `checks` only ever
//! contains entries for gates actually reached (spec.md: "denied by gate N"
//! must be distinguishable from "not reached gate N").

use crate::error::Reason;
use crate::integrity;
use crate::keystore::KeyStore;
use crate::model::{Checks, IntegrityManifest, Policy, Proposal};
use crate::nonce::NonceStore;
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::schema;
use crate::signature;

/// `verify`/`dryrun` skip rate limiting and do not record nonces (spec.md
/// §4.11 steps 6–7); `run` does both and is the only mode dispatch ever
/// follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Verify,
    Dryrun,
    Run,
}

impl Mode {
    fn consumes_resources(self) -> bool {
        matches!(self, Mode::Run)
    }
}

pub struct PipelineInputs<'a> {
    pub keystore: &'a KeyStore,
    pub policy_engine: &'a PolicyEngine,
    pub nonce_store: &'a NonceStore,
    pub rate_limiter: &'a RateLimiter,
    pub integrity_manifest: Option<&'a IntegrityManifest>,
    pub integrity_root: Option<&'a std::path::Path>,
    pub strict_mode: bool,
    pub skew_tolerance_secs: i64,
    /// Transport size limit (spec.md §6, default 1 MiB). Checked before
    /// the proposal is even parsed as JSON.
    pub max_proposal_bytes: usize,
}

pub struct Evaluation {
    pub decision: Decision,
    /// Present only when `decision.valid` — the parsed proposal and the
    /// policy it was authorized against, handed to the dispatcher.
    pub approved: Option<(Proposal, Policy)>,
}

pub use crate::model::Decision;

/// Run every gate in fixed order against the raw proposal bytes.
pub fn evaluate(mode: Mode, raw_bytes: &[u8], now: i64, inputs: &PipelineInputs) -> Evaluation {
    let mut checks = Checks::default();

    macro_rules! deny {
        ($reason:expr) => {
            return Evaluation {
                decision: Decision {
                    valid: false,
                    checks,
                    error: Some($reason),
                },
                approved: None,
            }
        };
    }

    // 0. Size limit (spec.md §6) — cheaper than parsing, so it runs first
    // and reports SCHEMA_ERROR like any other structurally-malformed input.
    if raw_bytes.len() > inputs.max_proposal_bytes {
        deny!(Reason::SchemaError);
    }

    // 1. Integrity preflight (strict mode only).
    if inputs.strict_mode {
        if let (Some(manifest), Some(root)) = (inputs.integrity_manifest, inputs.integrity_root) {
            if let Err(reason) = integrity::check_manifest(manifest, root) {
                deny!(reason);
            }
        }
    }

    // 2. Schema.
    let raw: serde_json::Value = match serde_json::from_slice(raw_bytes) {
        Ok(v) => v,
        Err(_) => deny!(Reason::SchemaError),
    };
    let proposal = match schema::validate_and_parse(&raw) {
        Ok(p) => p,
        Err(reason) => deny!(reason),
    };
    checks.schema = Some(true);

    // 3. Key resolution & lifecycle.
    let (_key, verifying_key) =
        match inputs
            .keystore
            .resolve(&proposal.signature.key_id, &proposal.requester_id, now)
        {
            Ok(pair) => pair,
            Err(reason) => deny!(reason),
        };
    checks.key_id = Some(true);

    // The signed policy's own security block is the primary source for the
    // two operator-tunable knobs below (spec.md §3); the ambient config
    // value is only a fallback for when the policy file can't be read yet.
    let raw_policy = inputs.policy_engine.raw_policy().ok();

    // 4. Timestamp skew — cheap rejection of stale messages; the signature
    // still covers the timestamp, so this gate cannot be used to spoof.
    let skew_tolerance_secs = raw_policy
        .as_ref()
        .map(|p| p.security.clock_skew_tolerance_secs)
        .unwrap_or(inputs.skew_tolerance_secs);
    if (now - proposal.timestamp).abs() > skew_tolerance_secs {
        deny!(Reason::TimestampSkewExceeded);
    }
    checks.timestamp = Some(true);

    // 5. Signature verification.
    if let Err(reason) = signature::verify(&proposal, &verifying_key) {
        deny!(reason);
    }
    checks.signature = Some(true);

    // 6. Rate limit — `run` only. Falls back to the policy's
    // `security.defaultRateLimit` when the requester has no `rateLimit` of
    // their own (spec.md §4.7); deny-by-default means "no limit configured"
    // must never mean "unthrottled".
    if mode.consumes_resources() {
        let requester_policy = raw_policy
            .as_ref()
            .and_then(|p| p.requesters.get(&proposal.requester_id).cloned());
        let (capacity, refill) = requester_policy
            .as_ref()
            .and_then(|r| r.rate_limit.as_ref())
            .map(|rl| (rl.capacity, rl.refill_per_second))
            .or_else(|| {
                raw_policy
                    .as_ref()
                    .map(|p| (p.security.default_rate_limit.capacity, p.security.default_rate_limit.refill_per_second))
            })
            .unwrap_or((0.0, 0.0));
        if capacity > 0.0 {
            if let Err(err) = inputs.rate_limiter.check(
                &proposal.requester_id,
                capacity,
                refill,
                now as f64,
            ) {
                deny!(err.as_reason().unwrap_or(Reason::RateLimitExceeded));
            }
        }
    }
    checks.rate = Some(true);

    // 7. Nonce — `run` records, `verify`/`dryrun` only check membership.
    if mode.consumes_resources() {
        if let Err(err) = inputs
            .nonce_store
            .consume(&proposal.session_id, &proposal.nonce, now)
        {
            deny!(err.as_reason().unwrap_or(Reason::ReplayDetected));
        }
    } else {
        match inputs.nonce_store.contains(&proposal.session_id, &proposal.nonce) {
            Ok(true) => deny!(Reason::ReplayDetected),
            Ok(false) => {}
            Err(_) => deny!(Reason::ReplayDetected),
        }
    }
    checks.nonce = Some(true);

    // 8. Policy enforcement: signed-policy preflight, then authorization.
    let preflighted = match inputs.policy_engine.preflight(inputs.keystore) {
        Ok(p) => p,
        Err(e) => deny!(e.as_reason().unwrap_or(Reason::PolicySignatureInvalid)),
    };
    if let Err(reason) = crate::policy::authorize(&preflighted.policy, &proposal) {
        deny!(reason);
    }
    checks.policy = Some(true);

    Evaluation {
        decision: Decision {
            valid: true,
            checks,
            error: None,
        },
        approved: Some((proposal, preflighted.policy)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        FilesystemPolicy, PolicyDefault, RateLimitPolicy, RequesterPolicy, Risk, SecurityPolicy,
        Signature as SigField, TrustedKey,
    };
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use std::collections::{BTreeMap, BTreeSet};

    struct Harness {
        _dir: tempfile::TempDir,
        keystore: KeyStore,
        policy_engine: PolicyEngine,
        nonce_store: NonceStore,
        rate_limiter: RateLimiter,
        signing_key: SigningKey,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let signing_key = SigningKey::generate(&mut OsRng);
            let pk_b64 =
                base64::Engine::encode(&base64::engine::general_purpose::STANDARD, signing_key.verifying_key().as_bytes());

            let trusted_key = TrustedKey {
                key_id: "k1".into(),
                public_key: pk_b64,
                not_before: 0,
                expires_at: 10_000_000_000,
                trusted_requesters: None,
            };
            let keystore = KeyStore::from_keys(vec![trusted_key]).unwrap();

            let mut requesters = BTreeMap::new();
            requesters.insert(
                "agent:gpt".to_string(),
                RequesterPolicy {
                    allow_adapters: BTreeSet::from(["noop".to_string()]),
                    allow_commands: BTreeSet::from(["RUN_SHELL".to_string()]),
                    filesystem: Some(FilesystemPolicy::default()),
                    exec: None,
                    rate_limit: Some(RateLimitPolicy {
                        capacity: 5.0,
                        refill_per_second: 1.0,
                    }),
                },
            );
            let policy = Policy {
                version: 1,
                created_at: 1000,
                default: PolicyDefault::Deny,
                requesters,
                security: SecurityPolicy {
                    clock_skew_tolerance_secs: 300,
                    default_rate_limit: RateLimitPolicy {
                        capacity: 10.0,
                        refill_per_second: 1.0,
                    },
                },
            };
            let sig = crate::policy::sign_policy(&policy, "k1", &signing_key).unwrap();

            std::fs::write(
                dir.path().join("policy.json"),
                serde_json::to_vec(&policy).unwrap(),
            )
            .unwrap();
            std::fs::write(dir.path().join("policy.sig.json"), serde_json::to_vec(&sig).unwrap())
                .unwrap();

            let policy_engine = PolicyEngine::new(
                dir.path().join("policy.json"),
                dir.path().join("policy.sig.json"),
                dir.path().join("policy.state.json"),
                true,
            );
            let nonce_store = NonceStore::new(dir.path().join("nonce.db.json"));
            let rate_limiter = RateLimiter::new(dir.path().join("rate.db.json"));

            Harness {
                _dir: dir,
                keystore,
                policy_engine,
                nonce_store,
                rate_limiter,
                signing_key,
            }
        }

        fn inputs(&self) -> PipelineInputs<'_> {
            PipelineInputs {
                keystore: &self.keystore,
                policy_engine: &self.policy_engine,
                nonce_store: &self.nonce_store,
                rate_limiter: &self.rate_limiter,
                integrity_manifest: None,
                integrity_root: None,
                strict_mode: false,
                skew_tolerance_secs: 300,
                max_proposal_bytes: 1_048_576,
            }
        }

        fn signed_proposal(&self, nonce_hex: &str, now: i64) -> Vec<u8> {
            let mut proposal = Proposal {
                id: "RUN_SHELL".into(),
                command_id: "c1".into(),
                requester_id: "agent:gpt".into(),
                session_id: "s1".into(),
                timestamp: now,
                nonce: nonce_hex.into(),
                requires: vec![],
                risk: Risk::Low,
                payload: serde_json::json!({"adapter": "noop"}),
                signature: SigField {
                    alg: "ed25519".into(),
                    key_id: "k1".into(),
                    sig: String::new(),
                },
            };
            signature::sign(&mut proposal, "k1", &self.signing_key).unwrap();
            serde_json::to_vec(&proposal).unwrap()
        }
    }

    #[test]
    fn happy_path_run_is_valid_and_consumes_nonce() {
        let h = Harness::new();
        let bytes = h.signed_proposal(&"a".repeat(64), 1000);
        let eval = evaluate(Mode::Run, &bytes, 1000, &h.inputs());
        assert!(eval.decision.valid);
        assert_eq!(eval.decision.checks.policy, Some(true));
        assert!(h.nonce_store.contains("s1", &"a".repeat(64)).unwrap());
    }

    #[test]
    fn replay_is_rejected_on_second_run() {
        let h = Harness::new();
        let bytes = h.signed_proposal(&"a".repeat(64), 1000);
        assert!(evaluate(Mode::Run, &bytes, 1000, &h.inputs()).decision.valid);
        let second = evaluate(Mode::Run, &bytes, 1000, &h.inputs());
        assert!(!second.decision.valid);
        assert_eq!(second.decision.error, Some(Reason::ReplayDetected));
    }

    #[test]
    fn signature_tamper_is_rejected_before_nonce_is_touched() {
        let h = Harness::new();
        let bytes = h.signed_proposal(&"b".repeat(64), 1000);
        let mut value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        value["payload"] = serde_json::json!({"adapter": "shell"});
        let tampered = serde_json::to_vec(&value).unwrap();

        let eval = evaluate(Mode::Run, &tampered, 1000, &h.inputs());
        assert_eq!(eval.decision.error, Some(Reason::SignatureInvalid));
        assert!(eval.decision.checks.nonce.is_none());
        assert!(!h.nonce_store.contains("s1", &"b".repeat(64)).unwrap());
    }

    #[test]
    fn expired_key_is_rejected_before_signature_is_checked() {
        let h = Harness::new();
        let bytes = h.signed_proposal(&"c".repeat(64), 1000);

        let mut inputs = h.inputs();
        let expired_key = TrustedKey {
            key_id: "k1".into(),
            public_key: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                h.signing_key.verifying_key().as_bytes(),
            ),
            not_before: 0,
            expires_at: 500, // expired relative to now=1000
            trusted_requesters: None,
        };
        let expired_store = KeyStore::from_keys(vec![expired_key]).unwrap();
        inputs.keystore = &expired_store;

        let eval = evaluate(Mode::Run, &bytes, 1000, &inputs);
        assert_eq!(eval.decision.error, Some(Reason::KeyExpired));
        assert!(eval.decision.checks.signature.is_none());
    }

    #[test]
    fn verify_mode_does_not_consume_the_nonce() {
        let h = Harness::new();
        let bytes = h.signed_proposal(&"d".repeat(64), 1000);
        let eval = evaluate(Mode::Verify, &bytes, 1000, &h.inputs());
        assert!(eval.decision.valid);
        assert!(!h.nonce_store.contains("s1", &"d".repeat(64)).unwrap());
    }

    #[test]
    fn timestamp_skew_symmetry() {
        let h = Harness::new();
        let too_old = h.signed_proposal(&"e".repeat(64), 1000 - 301);
        let eval = evaluate(Mode::Verify, &too_old, 1000, &h.inputs());
        assert_eq!(eval.decision.error, Some(Reason::TimestampSkewExceeded));

        let within = h.signed_proposal(&"f".repeat(64), 1000 - 299);
        let eval = evaluate(Mode::Verify, &within, 1000, &h.inputs());
        assert_ne!(eval.decision.error, Some(Reason::TimestampSkewExceeded));
    }

    #[test]
    fn requester_without_rate_limit_falls_back_to_policy_default() {
        let h = Harness::new();

        // Rewrite the on-disk policy so this requester has no `rateLimit`
        // of its own; `security.defaultRateLimit` (capacity 1, no refill)
        // must still gate it rather than leaving it unthrottled.
        let mut requesters = BTreeMap::new();
        requesters.insert(
            "agent:gpt".to_string(),
            RequesterPolicy {
                allow_adapters: BTreeSet::from(["noop".to_string()]),
                allow_commands: BTreeSet::from(["RUN_SHELL".to_string()]),
                filesystem: Some(FilesystemPolicy::default()),
                exec: None,
                rate_limit: None,
            },
        );
        let policy = Policy {
            version: 2,
            created_at: 1000,
            default: PolicyDefault::Deny,
            requesters,
            security: SecurityPolicy {
                clock_skew_tolerance_secs: 300,
                default_rate_limit: RateLimitPolicy {
                    capacity: 1.0,
                    refill_per_second: 0.0,
                },
            },
        };
        let sig = crate::policy::sign_policy(&policy, "k1", &h.signing_key).unwrap();
        std::fs::write(
            h.policy_engine.policy_path(),
            serde_json::to_vec(&policy).unwrap(),
        )
        .unwrap();
        std::fs::write(h.policy_engine.sig_path(), serde_json::to_vec(&sig).unwrap()).unwrap();

        let bytes_first = h.signed_proposal(&"1".repeat(64), 1000);
        assert!(evaluate(Mode::Run, &bytes_first, 1000, &h.inputs()).decision.valid);

        let bytes_second = h.signed_proposal(&"2".repeat(64), 1000);
        let second = evaluate(Mode::Run, &bytes_second, 1000, &h.inputs());
        assert_eq!(second.decision.error, Some(Reason::RateLimitExceeded));
    }

    #[test]
    fn oversized_proposal_is_rejected_before_parsing() {
        let h = Harness::new();
        let mut inputs = h.inputs();
        inputs.max_proposal_bytes = 10;
        let bytes = h.signed_proposal(&"a".repeat(64), 1000);
        let eval = evaluate(Mode::Verify, &bytes, 1000, &inputs);
        assert_eq!(eval.decision.error, Some(Reason::SchemaError));
        assert!(eval.decision.checks.schema.is_none());
    }

    #[test]
    fn unknown_requester_denied_by_default_policy() {
        let h = Harness::new();
        let mut proposal = Proposal {
            id: "RUN_SHELL".into(),
            command_id: "c2".into(),
            requester_id: "agent:stranger".into(),
            session_id: "s2".into(),
            timestamp: 1000,
            nonce: "9".repeat(64),
            requires: vec![],
            risk: Risk::Low,
            payload: serde_json::json!({"adapter": "noop"}),
            signature: SigField {
                alg: "ed25519".into(),
                key_id: "k1".into(),
                sig: String::new(),
            },
        };
        signature::sign(&mut proposal, "k1", &h.signing_key).unwrap();
        let bytes = serde_json::to_vec(&proposal).unwrap();

        let eval = evaluate(Mode::Verify, &bytes, 1000, &h.inputs());
        assert_eq!(eval.decision.error, Some(Reason::RequesterNotAllowed));
    }
}
