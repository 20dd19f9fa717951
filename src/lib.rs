//! `warden-core`: a trust-boundary controller standing between untrusted
//! proposal submitters and the side-effecting adapters that can mutate a
//! host environment. See the module-level docs on `pipeline` for the gate
//! order and `audit` for the tamper-evident ledger.
//!
//! Out of scope, by design: a CLI entry point, an HTTP façade, process
//! packaging, and concrete adapter implementations. Callers wire a
//! `Controller` together from file paths and register their own adapters.

pub mod audit;
pub mod canonical;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fsutil;
pub mod integrity;
pub mod keystore;
pub mod model;
pub mod nonce;
pub mod pipeline;
pub mod policy;
pub mod ratelimit;
pub mod schema;
pub mod signature;

use std::path::PathBuf;

use audit::AuditLog;
use config::WardenConfig;
use dispatch::AdapterRegistry;
use error::Reason;
use integrity::generate_manifest;
use keystore::KeyStore;
use model::{AuditEntry, Checks, Decision, IntegrityManifest};
use nonce::NonceStore;
use pipeline::{Mode, PipelineInputs};
use policy::{sign_policy, PolicyEngine};
use ratelimit::RateLimiter;

/// Owns every durable and read-only handle the pipeline needs. One
/// `Controller` per process; concurrency across callers is handled by file
/// locks held only for each resource's critical section, not by a
/// process-wide mutex (spec.md §9 "global singletons").
pub struct Controller {
    config: WardenConfig,
    keystore_path: PathBuf,
    integrity_manifest_path: PathBuf,
    policy_engine: PolicyEngine,
    nonce_store: NonceStore,
    rate_limiter: RateLimiter,
    audit_log: AuditLog,
    adapters: AdapterRegistry,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthReport {
    pub nonce_store_ok: bool,
    pub rate_limit_store_ok: bool,
    pub audit_log_ok: bool,
    pub keys_ok: bool,
    pub policy_ok: bool,
    pub integrity_manifest_ok: bool,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.nonce_store_ok
            && self.rate_limit_store_ok
            && self.audit_log_ok
            && self.keys_ok
            && self.policy_ok
            && self.integrity_manifest_ok
    }
}

impl Controller {
    /// Wire a `Controller` together from `config`, opening (and, for the
    /// audit log, crash-recovering) the durable stores.
    pub fn open(config: WardenConfig) -> Result<Self, error::WardenError> {
        let audit_log = AuditLog::open(&config.audit_log_path)?;
        let nonce_store = NonceStore::new(&config.nonce_store_path);
        let rate_limiter = RateLimiter::new(&config.rate_limit_store_path);
        let policy_engine = PolicyEngine::new(
            &config.policy_path,
            &config.policy_sig_path,
            &config.policy_state_path,
            config.strict_mode,
        );

        Ok(Controller {
            keystore_path: config.keys_path.clone(),
            integrity_manifest_path: config.integrity_manifest_path.clone(),
            policy_engine,
            nonce_store,
            rate_limiter,
            audit_log,
            adapters: AdapterRegistry::new(),
            config,
        })
    }

    pub fn register_adapter(&mut self, name: impl Into<String>, adapter: Box<dyn dispatch::Adapter>) {
        self.adapters.register(name, adapter);
    }

    fn load_keystore(&self) -> Result<KeyStore, error::WardenError> {
        KeyStore::load(&self.keystore_path).map_err(|e| match e {
            keystore::KeyStoreError::Warden(w) => w,
            other => error::WardenError::Other(other.to_string()),
        })
    }

    fn load_integrity_manifest(&self) -> Result<Option<IntegrityManifest>, error::WardenError> {
        match fsutil::read_optional(&self.integrity_manifest_path)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| error::WardenError::Parse {
                    what: "integrity.manifest.json".into(),
                    source: e,
                }),
            None => Ok(None),
        }
    }

    fn evaluate(&self, mode: Mode, raw_bytes: &[u8], now: i64) -> Decision {
        let keystore = match self.load_keystore() {
            Ok(ks) => ks,
            Err(_) => {
                return Decision {
                    valid: false,
                    checks: Checks::default(),
                    error: Some(Reason::KeyIdInvalid),
                }
            }
        };

        let manifest = self.load_integrity_manifest().unwrap_or(None);
        let manifest_root = self
            .integrity_manifest_path
            .parent()
            .map(|p| p.to_path_buf());

        let inputs = PipelineInputs {
            keystore: &keystore,
            policy_engine: &self.policy_engine,
            nonce_store: &self.nonce_store,
            rate_limiter: &self.rate_limiter,
            integrity_manifest: manifest.as_ref(),
            integrity_root: manifest_root.as_deref(),
            strict_mode: self.config.strict_mode,
            skew_tolerance_secs: self.config.skew_tolerance_secs,
            max_proposal_bytes: self.config.max_proposal_bytes,
        };

        let eval = pipeline::evaluate(mode, raw_bytes, now, &inputs);
        let decision = eval.decision.clone();

        let audit_entry = AuditEntry {
            seq: 0,
            timestamp: 0,
            entry_type: "DECISION".into(),
            command_id: command_id_from_raw(raw_bytes),
            decision: if decision.valid { "ALLOW".into() } else { "DENY".into() },
            reason: decision.error,
            checks: Some(decision.checks.clone()),
            adapter: None,
            exit_code: None,
            prev_hash: String::new(),
            hash: String::new(),
        };
        // Audit append is best-effort on the deny path (spec.md §7): a
        // failure here is logged, not surfaced, because the user-visible
        // decision is already a denial either way.
        if let Err(e) = self.audit_log.append(audit_entry, now) {
            tracing::error!(error = %e, "failed to append audit entry for denied proposal");
        }

        if !decision.valid || mode != Mode::Run {
            return decision;
        }

        let Some((proposal, policy)) = eval.approved else {
            return decision;
        };
        let Some(requester_policy) = policy.requesters.get(&proposal.requester_id).cloned() else {
            return decision;
        };

        match dispatch::dispatch(&proposal, &requester_policy, &self.adapters) {
            Ok(outcome) => {
                let exec_entry = AuditEntry {
                    seq: 0,
                    timestamp: 0,
                    entry_type: if outcome.result.is_success() {
                        "EXECUTED".into()
                    } else {
                        "EXECUTION_FAILED".into()
                    },
                    command_id: proposal.command_id.clone(),
                    decision: "ALLOW".into(),
                    reason: if outcome.result.is_success() {
                        None
                    } else {
                        Some(Reason::AdapterExecutionFailed)
                    },
                    checks: Some(decision.checks.clone()),
                    adapter: Some(outcome.adapter.clone()),
                    exit_code: Some(outcome.result.exit_code),
                    prev_hash: String::new(),
                    hash: String::new(),
                };
                // Non-repudiation is load-bearing on the allow path: if the
                // audit write fails here the caller must treat this as a
                // hard failure regardless of adapter success (spec.md §7).
                if self.audit_log.append(exec_entry, now).is_err() {
                    return Decision {
                        valid: false,
                        checks: decision.checks,
                        error: Some(Reason::AuditWriteFailed),
                    };
                }
                decision
            }
            Err(reason) => {
                let fail_entry = AuditEntry {
                    seq: 0,
                    timestamp: 0,
                    entry_type: "EXECUTION_FAILED".into(),
                    command_id: proposal.command_id.clone(),
                    decision: "ALLOW".into(),
                    reason: Some(reason),
                    checks: Some(decision.checks.clone()),
                    adapter: proposal.adapter().map(str::to_string),
                    exit_code: None,
                    prev_hash: String::new(),
                    hash: String::new(),
                };
                if self.audit_log.append(fail_entry, now).is_err() {
                    return Decision {
                        valid: false,
                        checks: decision.checks,
                        error: Some(Reason::AuditWriteFailed),
                    };
                }
                Decision {
                    valid: false,
                    checks: decision.checks,
                    error: Some(reason),
                }
            }
        }
    }

    /// Validate without consuming nonces or tokens (spec.md §6 `verify`).
    pub fn verify(&self, raw_bytes: &[u8], now: i64) -> Decision {
        self.evaluate(Mode::Verify, raw_bytes, now)
    }

    /// Validate without consuming nonces or tokens, identical gating to
    /// `verify` (spec.md §6 `dryrun` — kept as a distinct entry point
    /// because a caller's audit/observability treatment of the two may
    /// legitimately differ even though the gates are the same).
    pub fn dryrun(&self, raw_bytes: &[u8], now: i64) -> Decision {
        self.evaluate(Mode::Dryrun, raw_bytes, now)
    }

    /// Validate, consume the nonce and rate-limit token, and on success
    /// dispatch to the named adapter (spec.md §6 `run`).
    pub fn run(&self, raw_bytes: &[u8], now: i64) -> Decision {
        self.evaluate(Mode::Run, raw_bytes, now)
    }

    /// Walk the audit log and report the first hash-chain break, if any
    /// (spec.md §6 `audit-verify`).
    pub fn audit_verify(&self) -> Result<(), audit::AuditVerifyError> {
        self.audit_log.verify()
    }

    /// Hash every file in `paths` under `root` into a fresh manifest
    /// (spec.md §6 `integrity-generate`).
    pub fn integrity_generate(
        &self,
        root: &std::path::Path,
        paths: &[String],
    ) -> Result<IntegrityManifest, error::WardenError> {
        generate_manifest(root, paths)
    }

    /// Structural health probe (SPEC_FULL.md §2 `health`): readability and
    /// parseability of every durable store and read-only input, without
    /// running a full validation.
    pub fn health(&self) -> HealthReport {
        let nonce_store_ok = self.nonce_store.contains("", "").is_ok();
        let rate_limit_store_ok = fsutil::read_optional(self.rate_limiter.path()).is_ok();
        let audit_log_ok = fsutil::read_optional(self.audit_log.path()).is_ok();
        let keys_ok = self.load_keystore().is_ok();
        let policy_ok = self.policy_engine.raw_policy().is_ok();
        let integrity_manifest_ok = self.load_integrity_manifest().is_ok();

        HealthReport {
            nonce_store_ok,
            rate_limit_store_ok,
            audit_log_ok,
            keys_ok,
            policy_ok,
            integrity_manifest_ok,
        }
    }
}

fn command_id_from_raw(raw_bytes: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(raw_bytes)
        .ok()
        .and_then(|v| v.get("commandId").and_then(|c| c.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}
