use crate::error::{BundleError, BundleResult, IoContext};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".bundle.lock";

/// Exclusive advisory lock on a bundle directory, released on drop.
///
/// The lock file itself is left in place. Unlinking it while another
/// process waits on it would let a third process lock a fresh inode at the
/// same path.
#[derive(Debug)]
pub struct BundleLock {
    _file: File,
    path: PathBuf,
}

impl BundleLock {
    pub fn acquire(bundle_base: &Path) -> BundleResult<Self> {
        let path = bundle_base.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("Failed to create lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(BundleError::Locked { path });
        }
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
