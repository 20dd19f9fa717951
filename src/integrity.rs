//! Integrity check (spec.md §4.9) and the `integrity-generate`/
//! `integrity-check` library functions (SPEC_FULL.md §2).

use std::collections::BTreeSet;
use std::path::Path;

use crate::canonical;
use crate::error::{Reason, WardenError};
use crate::model::{IntegrityManifest, ManifestFileEntry};

/// Hash every file under `root` matching `paths` (relative to `root`) into
/// a fresh manifest with no signature attached.
pub fn generate_manifest(root: &Path, paths: &[String]) -> Result<IntegrityManifest, WardenError> {
    let mut files = Vec::with_capacity(paths.len());
    for rel in paths {
        let full = root.join(rel);
        let bytes = std::fs::read(&full).map_err(|e| WardenError::Io {
            path: full.display().to_string(),
            source: e,
        })?;
        files.push(ManifestFileEntry {
            path: rel.clone(),
            sha256: canonical::sha256_hex(&bytes),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(IntegrityManifest {
        files,
        signature: None,
    })
}

/// Verify every file in `manifest` against `root`. Any mismatch, missing
/// file, or file present on disk under a manifest-listed directory but
/// absent from the manifest is a failure (spec.md §4.9 "extra file").
pub fn check_manifest(manifest: &IntegrityManifest, root: &Path) -> Result<(), Reason> {
    let manifest_paths: BTreeSet<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();

    for entry in &manifest.files {
        let full = root.join(&entry.path);
        let bytes = std::fs::read(&full).map_err(|_| Reason::IntegrityFail)?;
        if canonical::sha256_hex(&bytes) != entry.sha256 {
            return Err(Reason::IntegrityFail);
        }
    }

    // Extra-file detection only applies within directories the manifest
    // actually covers, so callers can scope a manifest to a subtree.
    let mut dirs: BTreeSet<&Path> = BTreeSet::new();
    for entry in &manifest.files {
        if let Some(parent) = Path::new(&entry.path).parent() {
            dirs.insert(parent);
        } else {
            dirs.insert(Path::new(""));
        }
    }
    for dir in dirs {
        let full_dir = root.join(dir);
        let read_dir = match std::fs::read_dir(&full_dir) {
            Ok(rd) => rd,
            Err(_) => continue,
        };
        for entry in read_dir {
            let entry = entry.map_err(|_| Reason::IntegrityFail)?;
            if !entry.file_type().map_err(|_| Reason::IntegrityFail)?.is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .map_err(|_| Reason::IntegrityFail)?
                .to_string_lossy()
                .replace('\\', "/");
            if !manifest_paths.contains(rel.as_str()) {
                return Err(Reason::IntegrityFail);
            }
        }
    }
    Ok(())
}
