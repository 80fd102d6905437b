//! TW-009: BLAKE3 digests for generated artifacts and copied sources.

use std::path::Path;
use walkdir::WalkDir;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash a directory tree (sorted walk, relative paths included).
/// Symlinks are skipped.
pub fn hash_directory(path: &Path) -> Result<String, String> {
    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(path).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| format!("cannot walk {}: {}", path.display(), e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(path)
            .map_err(|e| format!("path prefix error: {}", e))?
            .to_string_lossy()
            .into_owned();
        let bytes = std::fs::read(entry.path())
            .map_err(|e| format!("cannot read {}: {}", entry.path().display(), e))?;
        hasher.update(rel.as_bytes());
        hasher.update(b"\0");
        hasher.update(blake3::hash(&bytes).to_hex().as_bytes());
        hasher.update(b"\n");
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}
