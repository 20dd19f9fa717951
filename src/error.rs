//! Stable error taxonomy (spec.md §7).
//!
//! `Reason` is the currency of every gate failure: it is what ends up in
//! `Decision.reason` and in audit entries. Module-local error types carry
//! richer context for logging, but fold into a `Reason` at the pipeline
//! boundary — nothing upstream of `pipeline.rs` should ever need to match on
//! anything finer-grained than this enum.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    SchemaError,
    ParseError,

    KeyIdInvalid,
    KeyNotYetValid,
    KeyExpired,
    KeyNotAuthorizedForRequester,
    SignatureInvalid,
    TimestampSkewExceeded,

    ReplayDetected,
    RateLimitExceeded,

    PolicySignatureMissing,
    PolicySignatureInvalid,
    PolicyVersionRegression,
    PolicyCreatedAtRegression,
    RequesterNotAllowed,
    AdapterNotAllowed,
    CommandNotAllowed,
    FilesystemNotAllowed,
    ExecNotAllowed,

    IntegrityFail,

    HashMismatch,
    PrevHashMismatch,

    AdapterNotRegistered,
    AdapterExecutionFailed,
    AuditWriteFailed,
}

impl Reason {
    /// The stable identifier used in `Decision.reason` and audit entries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::SchemaError => "SCHEMA_ERROR",
            Reason::ParseError => "PARSE_ERROR",
            Reason::KeyIdInvalid => "KEY_ID_INVALID",
            Reason::KeyNotYetValid => "KEY_NOT_YET_VALID",
            Reason::KeyExpired => "KEY_EXPIRED",
            Reason::KeyNotAuthorizedForRequester => "KEY_NOT_AUTHORIZED_FOR_REQUESTER",
            Reason::SignatureInvalid => "SIGNATURE_INVALID",
            Reason::TimestampSkewExceeded => "TIMESTAMP_SKEW_EXCEEDED",
            Reason::ReplayDetected => "REPLAY_DETECTED",
            Reason::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Reason::PolicySignatureMissing => "POLICY_SIGNATURE_MISSING",
            Reason::PolicySignatureInvalid => "POLICY_SIGNATURE_INVALID",
            Reason::PolicyVersionRegression => "POLICY_VERSION_REGRESSION",
            Reason::PolicyCreatedAtRegression => "POLICY_CREATEDAT_REGRESSION",
            Reason::RequesterNotAllowed => "REQUESTER_NOT_ALLOWED",
            Reason::AdapterNotAllowed => "ADAPTER_NOT_ALLOWED",
            Reason::CommandNotAllowed => "COMMAND_NOT_ALLOWED",
            Reason::FilesystemNotAllowed => "FILESYSTEM_NOT_ALLOWED",
            Reason::ExecNotAllowed => "EXEC_NOT_ALLOWED",
            Reason::IntegrityFail => "INTEGRITY_FAIL",
            Reason::HashMismatch => "HASH_MISMATCH",
            Reason::PrevHashMismatch => "PREV_HASH_MISMATCH",
            Reason::AdapterNotRegistered => "ADAPTER_NOT_REGISTERED",
            Reason::AdapterExecutionFailed => "ADAPTER_EXECUTION_FAILED",
            Reason::AuditWriteFailed => "AUDIT_WRITE_FAILED",
        }
    }

    /// CLI exit code per spec.md §6. Not used internally; exposed for the
    /// out-of-scope CLI façade to map a `Reason` onto its contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            Reason::IntegrityFail => 8,
            Reason::ParseError => 2,
            Reason::AdapterExecutionFailed | Reason::AuditWriteFailed => 9,
            _ => 1,
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {what}: {source}")]
    Parse {
        what: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("lock poisoned for {0}")]
    LockPoisoned(String),
    #[error("{0}")]
    Reason(Reason),
    #[error("{0}")]
    Other(String),
}

impl From<Reason> for WardenError {
    fn from(r: Reason) -> Self {
        WardenError::Reason(r)
    }
}

impl WardenError {
    pub fn as_reason(&self) -> Option<Reason> {
        match self {
            WardenError::Reason(r) => Some(*r),
            _ => None,
        }
    }
}
