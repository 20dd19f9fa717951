//! Nonce store (spec.md §4.6). Durable set of consumed `(sessionId, nonce)`
//! pairs. `consume` is atomic under concurrent callers: the exclusive file
//! lock in `fsutil` serializes the read-modify-write cycle so two
//! concurrent calls for the same pair never both observe `Ok`.

use std::path::{Path, PathBuf};

use crate::error::{Reason, WardenError};
use crate::fsutil;
use crate::model::{NonceEntry, NonceFile};

pub struct NonceStore {
    path: PathBuf,
}

impl NonceStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        NonceStore { path: path.into() }
    }

    fn load(&self) -> Result<NonceFile, WardenError> {
        match fsutil::read_optional(&self.path)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| WardenError::Parse {
                what: "nonce.db.json".into(),
                source: e,
            }),
            None => Ok(NonceFile::default()),
        }
    }

    fn save(&self, file: &NonceFile) -> Result<(), WardenError> {
        let bytes = serde_json::to_vec(file).map_err(|e| WardenError::Parse {
            what: "nonce.db.json".into(),
            source: e,
        })?;
        fsutil::atomic_write(&self.path, &bytes)
    }

    /// Membership check without recording — used by `verify`/`dryrun`
    /// (spec.md §4.11 step 7), which must not mutate the store.
    pub fn contains(&self, session_id: &str, nonce: &str) -> Result<bool, WardenError> {
        let file = self.load()?;
        Ok(file
            .entries
            .iter()
            .any(|e| e.session_id == session_id && e.nonce == nonce))
    }

    /// Atomically record `(sessionId, nonce)` or detect an existing entry.
    /// No state change occurs on `ReplayDetected`. Internal I/O failures
    /// surface as `WardenError`; a detected replay surfaces as
    /// `WardenError::Reason(Reason::ReplayDetected)`, so callers can match
    /// on either uniformly with `?`.
    pub fn consume(&self, session_id: &str, nonce: &str, now: i64) -> Result<(), WardenError> {
        fsutil::with_lock(&self.path, || {
            let mut file = self.load()?;
            if file
                .entries
                .iter()
                .any(|e| e.session_id == session_id && e.nonce == nonce)
            {
                return Err(Reason::ReplayDetected.into());
            }
            file.entries.push(NonceEntry {
                session_id: session_id.to_string(),
                nonce: nonce.to_string(),
                first_seen_at: now,
            });
            self.save(&file)
        })
    }

    /// Drop entries for sessions whose nonces are all older than
    /// `now - retention`, never dropping an entry within skew tolerance of
    /// wall clock (SPEC_FULL.md §2).
    pub fn compact(&self, now: i64, retention: i64) -> Result<(), WardenError> {
        fsutil::with_lock(&self.path, || {
            let mut file = self.load()?;
            file.entries.retain(|e| now - e.first_seen_at <= retention);
            self.save(&file)
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
