//! Change detection over declared run dependencies.
//!
//! Each run writes a candidate fingerprint next to the accepted one. The
//! candidate only replaces the accepted file via [`DependencyFingerprint::promote`],
//! after the work it gates has finished, so an interrupted run is seen as
//! changed next time.

use crate::artifact::filesystem::{atomic_rename, write_atomic};
use crate::checksum::sha256_str;
use crate::error::{BundleError, BundleResult, IoContext};
use crate::layout::CacheLayout;
use crate::workspace::WorkspacePackage;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct DependencyFingerprint {
    accepted: PathBuf,
    candidate: PathBuf,
}

impl DependencyFingerprint {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            accepted: layout.dependency_hash_path(),
            candidate: layout.dependency_hash_cache_path(),
        }
    }

    /// Serialized package name to dependency hash map for the selected
    /// packages.
    pub fn compute(packages: &[WorkspacePackage]) -> BundleResult<String> {
        let hashes: BTreeMap<&str, String> = packages
            .iter()
            .filter(|p| p.selected)
            .map(|p| {
                let mut deps: Vec<String> = p.run_depends.iter().map(ToString::to_string).collect();
                deps.sort();
                (p.name.as_str(), sha256_str(&deps.join(" ")))
            })
            .collect();
        serde_json::to_string(&hashes).map_err(|source| BundleError::Json {
            context: "Failed to encode dependency fingerprint".to_string(),
            source,
        })
    }

    /// Write the candidate fingerprint and report whether it differs from
    /// the accepted one. A missing accepted fingerprint counts as changed.
    pub fn has_changed(&self, packages: &[WorkspacePackage]) -> BundleResult<bool> {
        let current = Self::compute(packages)?;
        debug!("Hash for current dependencies: {current}");

        let changed = if self.accepted.is_file() {
            let previous = fs::read_to_string(&self.accepted)
                .io_context(|| format!("Failed to read {}", self.accepted.display()))?;
            previous != current
        } else {
            true
        };
        write_atomic(&self.candidate, current.as_bytes())?;
        Ok(changed)
    }

    /// Accept the candidate written by the last [`has_changed`](Self::has_changed).
    pub fn promote(&self) -> BundleResult<()> {
        if self.candidate.is_file() {
            atomic_rename(&self.candidate, &self.accepted)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BundleFormat;
    use tempfile::TempDir;

    fn talker(dep: &str) -> Vec<WorkspacePackage> {
        vec![WorkspacePackage::new("talker", [dep, "pip3:numpy"])]
    }

    #[test]
    fn unchanged_after_promote() {
        let tmp = TempDir::new().unwrap();
        let layout = CacheLayout::open(tmp.path(), &tmp.path().join("b"), BundleFormat::V2).unwrap();
        let fp = DependencyFingerprint::new(&layout);

        assert!(fp.has_changed(&talker("foo==1.0")).unwrap());
        fp.promote().unwrap();
        assert!(!fp.has_changed(&talker("foo==1.0")).unwrap());
        assert!(fp.has_changed(&talker("foo==2.0")).unwrap());
    }

    #[test]
    fn unpromoted_change_is_reported_again() {
        let tmp = TempDir::new().unwrap();
        let layout = CacheLayout::open(tmp.path(), &tmp.path().join("b"), BundleFormat::V2).unwrap();
        let fp = DependencyFingerprint::new(&layout);

        assert!(fp.has_changed(&talker("foo==1.0")).unwrap());
        assert!(fp.has_changed(&talker("foo==1.0")).unwrap());
        assert!(layout.dependency_hash_cache_path().is_file());
        assert!(!layout.dependency_hash_path().exists());
    }

    #[test]
    fn order_and_unselected_packages_do_not_matter() {
        let a = WorkspacePackage::new("a", ["x", "y"]);
        let b = WorkspacePackage::new("b", ["z"]);
        let mut hidden = WorkspacePackage::new("hidden", ["w"]);
        hidden.selected = false;

        let one = DependencyFingerprint::compute(&[a.clone(), b.clone()]).unwrap();
        let reordered = WorkspacePackage::new("a", ["y", "x"]);
        let two = DependencyFingerprint::compute(&[b, hidden, reordered]).unwrap();
        assert_eq!(one, two);
        assert!(one.starts_with("{\"a\":"));
        assert!(!two.contains("hidden"));
    }

    #[test]
    fn promote_replaces_accepted_file() {
        let tmp = TempDir::new().unwrap();
        let layout = CacheLayout::open(tmp.path(), &tmp.path().join("b"), BundleFormat::V2).unwrap();
        let fp = DependencyFingerprint::new(&layout);
        fp.has_changed(&talker("foo==1.0")).unwrap();
        fp.promote().unwrap();

        let accepted = fs::read_to_string(layout.dependency_hash_path()).unwrap();
        assert_eq!(accepted, DependencyFingerprint::compute(&talker("foo==1.0")).unwrap());
        assert!(!layout.dependency_hash_cache_path().exists());
        // Nothing left to promote.
        fp.promote().unwrap();
    }
}
