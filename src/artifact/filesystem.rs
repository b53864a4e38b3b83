//! Filesystem utilities for staging and publishing bundle artifacts.

use crate::error::{BundleResult, IoContext};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Recursively copy a directory, preserving symlinks.
///
/// Unlike `fs::copy`, this properly handles:
/// - Nested directories
/// - Symbolic links (preserved, not followed)
/// - File permissions
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> BundleResult<()> {
    if !dst.exists() {
        fs::create_dir_all(dst)
            .io_context(|| format!("Failed to create directory: {}", dst.display()))?;
    }

    for entry in
        fs::read_dir(src).io_context(|| format!("Failed to read directory: {}", src.display()))?
    {
        let entry = entry.io_context(|| format!("Failed to read entry in {}", src.display()))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let file_type = entry
            .file_type()
            .io_context(|| format!("Failed to stat {}", src_path.display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)
                .io_context(|| format!("Failed to read symlink: {}", src_path.display()))?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)
                    .io_context(|| format!("Failed to replace {}", dst_path.display()))?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .io_context(|| format!("Failed to create symlink: {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)
                .io_context(|| format!("Failed to copy file: {}", src_path.display()))?;
        }
    }

    Ok(())
}

/// Remove a directory tree if present.
pub fn remove_dir_if_exists(path: &Path) -> BundleResult<()> {
    if path.exists() {
        fs::remove_dir_all(path).io_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Remove a file if present.
pub fn remove_file_if_exists(path: &Path) -> BundleResult<()> {
    if path.exists() || path.is_symlink() {
        fs::remove_file(path).io_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Move `src` over `dst`, replacing it in one step when both live on the
/// same filesystem.
pub fn atomic_rename(src: &Path, dst: &Path) -> BundleResult<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .io_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_e) => {
            // EXDEV: fall back to copy+remove.
            fs::copy(src, dst).io_context(|| {
                format!("Failed to copy {} to {}", src.display(), dst.display())
            })?;
            fs::remove_file(src)
                .io_context(|| format!("Failed to remove tmp {}", src.display()))?;
            Ok(())
        }
    }
}

/// Write `contents` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> BundleResult<()> {
    let tmp = sibling_tmp_path(path);
    fs::write(&tmp, contents).io_context(|| format!("Failed to write {}", tmp.display()))?;
    atomic_rename(&tmp, path)
}

/// Unique temp path next to `path` (same directory, so renames stay on one
/// filesystem).
pub fn sibling_tmp_path(path: &Path) -> PathBuf {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{name}.{}-{n}.partial", std::process::id()))
}
