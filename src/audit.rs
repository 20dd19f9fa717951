//! Audit log (spec.md §4.10). Append-only, hash-chained JSONL ledger.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::canonical;
use crate::error::WardenError;
use crate::fsutil::ExclusiveLock;
use crate::model::AuditEntry;

const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, thiserror::Error)]
pub enum AuditVerifyError {
    #[error("hash mismatch at seq {seq}")]
    HashMismatch { seq: u64 },
    #[error("prevHash mismatch at seq {seq}")]
    PrevHashMismatch { seq: u64 },
    #[error("io error reading audit log: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed audit log entry: {0}")]
    Malformed(String),
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// Open the log, scanning for and truncating a partial final line left
    /// by a crash mid-write (spec.md §5).
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, WardenError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| WardenError::Io {
                path: dir.display().to_string(),
                source: e,
            })?;
        }
        truncate_partial_final_line(&path)?;
        Ok(AuditLog { path })
    }

    fn last_entry(&self) -> Result<Option<AuditEntry>, WardenError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(WardenError::Io {
                    path: self.path.display().to_string(),
                    source: e,
                })
            }
        };
        let reader = BufReader::new(file);
        let mut last = None;
        for line in reader.lines() {
            let line = line.map_err(|e| WardenError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            last = Some(line);
        }
        match last {
            Some(line) => {
                let entry: AuditEntry = serde_json::from_str(&line).map_err(|e| WardenError::Parse {
                    what: "audit.log.jsonl".into(),
                    source: e,
                })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Append `entry` with `seq`/`timestamp`/`prevHash`/`hash` populated by
    /// this call, per the four-step procedure in spec.md §4.10.
    pub fn append(
        &self,
        mut entry: AuditEntry,
        now: i64,
    ) -> Result<AuditEntry, WardenError> {
        let _guard = ExclusiveLock::acquire(&self.path)?;

        let prev = self.last_entry()?;
        let (prev_hash, seq) = match prev {
            Some(e) => (e.hash, e.seq + 1),
            None => (GENESIS_HASH.to_string(), 1),
        };
        entry.prev_hash = prev_hash;
        entry.seq = seq;
        entry.timestamp = now;
        entry.hash = String::new();
        let canonical = canonical::canonicalize_without_field(&entry, "hash").map_err(|e| {
            WardenError::Parse {
                what: "audit entry".into(),
                source: e,
            }
        })?;
        entry.hash = canonical::sha256_hex(canonical.as_bytes());

        let line = serde_json::to_string(&entry).map_err(|e| WardenError::Parse {
            what: "audit entry".into(),
            source: e,
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WardenError::Io {
                path: self.path.display().to_string(),
                source: e,
            })?;
        let write_result = (|| -> std::io::Result<()> {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()
        })();
        if let Err(e) = write_result {
            // Truncate any partial line before surfacing the failure, so
            // the chain is never left with a dangling fragment.
            let _ = truncate_partial_final_line(&self.path);
            return Err(WardenError::Io {
                path: self.path.display().to_string(),
                source: e,
            });
        }
        Ok(entry)
    }

    /// Walk the full chain, recomputing each entry's hash and checking
    /// linkage. Returns the first mismatching `seq`.
    pub fn verify(&self) -> Result<(), AuditVerifyError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Ok(()),
        };
        let reader = BufReader::new(file);
        let mut expected_prev = GENESIS_HASH.to_string();

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|e| AuditVerifyError::Malformed(e.to_string()))?;

            if entry.prev_hash != expected_prev {
                return Err(AuditVerifyError::PrevHashMismatch { seq: entry.seq });
            }

            let mut unhashed = entry.clone();
            unhashed.hash = String::new();
            let canonical = canonical::canonicalize_without_field(&unhashed, "hash")
                .map_err(|e| AuditVerifyError::Malformed(e.to_string()))?;
            let recomputed = canonical::sha256_hex(canonical.as_bytes());
            if recomputed != entry.hash {
                return Err(AuditVerifyError::HashMismatch { seq: entry.seq });
            }

            expected_prev = entry.hash;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scan for a final line that isn't valid JSON (a crash mid-write) and
/// truncate it off, per spec.md §5's crash-recovery requirement.
fn truncate_partial_final_line(path: &Path) -> Result<(), WardenError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(WardenError::Io {
                path: path.display().to_string(),
                source: e,
            })
        }
    };

    let len = file
        .metadata()
        .map_err(|e| WardenError::Io {
            path: path.display().to_string(),
            source: e,
        })?
        .len();
    if len == 0 {
        return Ok(());
    }

    let reader = BufReader::new(&file);
    let mut valid_len: u64 = 0;
    let mut offset: u64 = 0;
    for line in reader.lines() {
        let line = line.map_err(|e| WardenError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let line_len = line.len() as u64 + 1; // + newline
        if line.trim().is_empty() {
            offset += line_len;
            continue;
        }
        if serde_json::from_str::<AuditEntry>(&line).is_ok() {
            offset += line_len;
            valid_len = offset;
        } else {
            break;
        }
    }

    if valid_len < len {
        file.set_len(valid_len).map_err(|e| WardenError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        file.seek(SeekFrom::End(0)).map_err(|e| WardenError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
    }
    Ok(())
}
