//! Atomic file writes and exclusive locking for the durable stores
//! (spec.md §5: "single-writer per durable resource, enforced by
//! file-level exclusive locking").

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::WardenError;

fn io_err(path: &Path, source: std::io::Error) -> WardenError {
    WardenError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write `contents` to `path` atomically: write to a temp file in the same
/// directory, then rename over the target. Either the old or the new
/// content is ever observed, never a partial write.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), WardenError> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let mut tmp = tempfile::Builder::new()
        .tempfile_in(dir)
        .map_err(|e| io_err(dir, e))?;
    tmp.as_file_mut()
        .write_all(contents)
        .map_err(|e| io_err(path, e))?;
    tmp.as_file_mut().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path)
        .map_err(|e| io_err(path, e.error))?;
    Ok(())
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

/// An exclusive lock guard held for the duration of a read-modify-write
/// critical section on `path`'s sibling `.lock` file. Unlocks on drop.
pub struct ExclusiveLock {
    file: File,
}

impl ExclusiveLock {
    pub fn acquire(path: &Path) -> Result<Self, WardenError> {
        let lock_path = lock_path_for(path);
        if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .map_err(|e| io_err(&lock_path, e))?;
        file.lock_exclusive().map_err(|e| io_err(&lock_path, e))?;
        Ok(ExclusiveLock { file })
    }
}

impl Drop for ExclusiveLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Run `f` while holding the exclusive lock for `path`'s durable resource.
pub fn with_lock<T>(
    path: &Path,
    f: impl FnOnce() -> Result<T, WardenError>,
) -> Result<T, WardenError> {
    let _guard = ExclusiveLock::acquire(path)?;
    f()
}

/// Read a file's contents, returning `Ok(None)` if it does not exist yet
/// rather than an error — several durable stores start empty.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, WardenError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}
