//! Rate limiter (spec.md §4.7). Token bucket per `requesterId`, persisted
//! atomically with the same durability guarantee as the nonce store.

use std::path::{Path, PathBuf};

use crate::error::{Reason, WardenError};
use crate::fsutil;
use crate::model::{RateLimitFile, TokenBucket};

pub struct RateLimiter {
    path: PathBuf,
}

impl RateLimiter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        RateLimiter { path: path.into() }
    }

    fn load(&self) -> Result<RateLimitFile, WardenError> {
        match fsutil::read_optional(&self.path)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| WardenError::Parse {
                what: "rate-limit.db.json".into(),
                source: e,
            }),
            None => Ok(RateLimitFile::default()),
        }
    }

    fn save(&self, file: &RateLimitFile) -> Result<(), WardenError> {
        let bytes = serde_json::to_vec(file).map_err(|e| WardenError::Parse {
            what: "rate-limit.db.json".into(),
            source: e,
        })?;
        fsutil::atomic_write(&self.path, &bytes)
    }

    /// Refill then attempt to spend one token for `requester_id`. `now` is
    /// epoch seconds as a float so sub-second refill is exact under test.
    pub fn check(
        &self,
        requester_id: &str,
        capacity: f64,
        refill_per_second: f64,
        now: f64,
    ) -> Result<(), WardenError> {
        fsutil::with_lock(&self.path, || {
            let mut file = self.load()?;
            let bucket = file
                .buckets
                .entry(requester_id.to_string())
                .or_insert(TokenBucket {
                    tokens: capacity,
                    last_refill_at: now,
                });

            let elapsed = (now - bucket.last_refill_at).max(0.0);
            bucket.tokens = (bucket.tokens + elapsed * refill_per_second).min(capacity);
            bucket.last_refill_at = now;

            if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                self.save(&file)?;
                Ok(())
            } else {
                // No state change beyond the refill itself — matches the
                // nonce store's "no change on failure" contract at the
                // token-count level (spec.md §4.7 only decrements on Ok).
                self.save(&file)?;
                Err(Reason::RateLimitExceeded.into())
            }
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
