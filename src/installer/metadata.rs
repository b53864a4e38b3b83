use crate::artifact::filesystem::{atomic_rename, write_atomic};
use crate::error::{BundleError, BundleResult, IoContext};
use crate::layout::CacheLayout;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the installer metadata file inside a format 2 bundle.
pub const INSTALLER_METADATA_FILE: &str = "installer_metadata.json";

/// Persists the combined installer results and detects changes between
/// runs. This catches dependency content changes (a new upstream release)
/// that leave the declared dependencies untouched.
///
/// Results are compared against the accepted copy and written as a
/// candidate. The candidate is only accepted by [`promote`](Self::promote),
/// so results from a run that failed later stay pending and are compared
/// again next time.
#[derive(Debug, Clone)]
pub struct InstallerMetadataTracker {
    accepted: PathBuf,
    candidate: PathBuf,
}

impl InstallerMetadataTracker {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            accepted: layout.installer_metadata_path(),
            candidate: layout.installer_metadata_cache_path(),
        }
    }

    /// Metadata that describes the dependencies overlay in the cache.
    pub fn path(&self) -> &Path {
        &self.accepted
    }

    pub fn exists(&self) -> bool {
        self.accepted.is_file()
    }

    /// Whether an earlier run recorded results it never accepted.
    pub fn has_pending(&self) -> bool {
        self.candidate.is_file()
    }

    /// Metadata for the bundle being written: the candidate when one was
    /// recorded, otherwise the accepted copy.
    pub fn current_path(&self) -> &Path {
        if self.has_pending() {
            &self.candidate
        } else {
            &self.accepted
        }
    }

    /// Store `results` as the candidate and report whether they differ from
    /// the accepted copy. A missing accepted copy counts as changed.
    ///
    /// Object keys serialize sorted, so equal results always produce equal
    /// text.
    pub fn record_and_compare(&self, results: &BTreeMap<String, Value>) -> BundleResult<bool> {
        let current = serde_json::to_string(results).map_err(|source| BundleError::Json {
            context: "Failed to encode installer metadata".to_string(),
            source,
        })?;
        let changed = if self.exists() {
            let previous = fs::read_to_string(&self.accepted)
                .io_context(|| format!("Failed to read {}", self.accepted.display()))?;
            previous != current
        } else {
            true
        };
        write_atomic(&self.candidate, current.as_bytes())?;
        Ok(changed)
    }

    /// Accept the candidate written by the last
    /// [`record_and_compare`](Self::record_and_compare).
    pub fn promote(&self) -> BundleResult<()> {
        if self.has_pending() {
            atomic_rename(&self.candidate, &self.accepted)?;
        }
        Ok(())
    }
}
