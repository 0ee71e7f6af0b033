//! Crash-safe artifact writes.
//!
//! Received files are written to a hidden sibling first and renamed into
//! place, so a reader never observes a half-written artifact. A name that is
//! already taken gets a ` (n)` suffix instead of being overwritten.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::error;

/// Atomically write `content` to `path` via a temporary sibling and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let tmp_path = temp_sibling(path);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "artifact_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "artifact_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// First free path for `file_name` inside `dir`: `name.ext`, then
/// `name (1).ext`, `name (2).ext`, ...
pub fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let as_path = Path::new(file_name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let ext = as_path.extension().and_then(|e| e.to_str());

    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.part"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("roomdrop_test_{name}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_atomic_write_creates_parents() {
        let dir = test_dir("atomic_parents");
        let path = dir.join("nested").join("photo.jpg");

        atomic_write(&path, b"hello").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_atomic_write_leaves_no_part_file() {
        let dir = test_dir("atomic_part");
        let path = dir.join("report.pdf");

        atomic_write(&path, b"data").unwrap();
        assert!(!temp_sibling(&path).exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_unique_path_adds_suffix() {
        let dir = test_dir("unique_suffix");
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a.txt"));

        std::fs::write(dir.join("a.txt"), b"1").unwrap();
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a (1).txt"));

        std::fs::write(dir.join("a (1).txt"), b"2").unwrap();
        assert_eq!(unique_path(&dir, "a.txt"), dir.join("a (2).txt"));

        std::fs::write(dir.join("Makefile"), b"3").unwrap();
        assert_eq!(unique_path(&dir, "Makefile"), dir.join("Makefile (1)"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
