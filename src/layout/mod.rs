//! On-disk layout of a bundle directory.
//!
//! [`CacheLayout`] is created once per invocation. It validates the marker
//! files left by earlier runs, decides where intermediate artifacts live and
//! holds the directory lock until dropped. Every other component asks it for
//! paths instead of joining them itself.
//!
//! ```text
//! <bundle_base>/
//!   .bundled_by .bundle_version .bundle_cache_version .bundle.lock COLCON_IGNORE
//!   output.tar | output.tar.gz      final bundle
//!   sources.tar.gz                  optional
//!   cache/                          schema 2 only; schema 1 keeps these flat
//!     bundle_staging/ installer_cache/ workspace_staging/
//!     dependencies.tar.gz workspace.tar.gz
//!     installer_metadata.json installer_metadata_cache.json
//!     dependency_hash.json dependency_hash_cache.json .valid
//!     bundle.tar metadata.tar version
//! ```

pub mod lock;
pub mod markers;

use crate::artifact::filesystem::{remove_dir_if_exists, remove_file_if_exists};
use crate::error::{BundleError, BundleResult, IoContext};
use lock::BundleLock;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker that keeps workspace package discovery out of the bundle directory.
pub const IGNORE_MARKER: &str = "COLCON_IGNORE";

/// Shape of the produced bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BundleFormat {
    /// Single gzip tar holding `version`, `metadata.tar` and `bundle.tar`.
    V1,
    /// Overlay container with a fixed metadata region.
    #[default]
    V2,
}

impl BundleFormat {
    pub fn as_u32(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

impl TryFrom<u32> for BundleFormat {
    type Error = BundleError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            other => Err(BundleError::InvalidState(format!(
                "unsupported bundle format version {other}"
            ))),
        }
    }
}

impl fmt::Display for BundleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Where intermediate artifacts are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSchema {
    /// Directly under the bundle directory.
    Flat,
    /// Under `<bundle_base>/cache`, discarded unless the last run finished.
    Nested,
}

#[derive(Debug)]
pub struct CacheLayout {
    install_base: PathBuf,
    bundle_base: PathBuf,
    cache_dir: PathBuf,
    format: BundleFormat,
    schema: CacheSchema,
    _lock: BundleLock,
}

impl CacheLayout {
    /// Prepare `bundle_base` for a `format` bundle of `install_base`.
    ///
    /// Fails with [`BundleError::IncompatibleCache`] when the directory was
    /// used by another tool or for another format, and with
    /// [`BundleError::Locked`] while another invocation holds it.
    pub fn open(install_base: &Path, bundle_base: &Path, format: BundleFormat) -> BundleResult<Self> {
        let previously_bundled = bundle_base.is_dir();
        if !previously_bundled {
            create_bundle_dir(bundle_base)?;
        }
        let lock = BundleLock::acquire(bundle_base)?;

        markers::check_and_mark_format_version(bundle_base, format.as_u32(), previously_bundled)?;
        let schema = match markers::get_and_mark_cache_version(bundle_base, previously_bundled)? {
            1 => CacheSchema::Flat,
            2 => CacheSchema::Nested,
            other => {
                return Err(BundleError::IncompatibleCache {
                    path: bundle_base.to_path_buf(),
                    reason: format!("unknown cache version {other}"),
                })
            }
        };
        markers::check_and_mark_tool(bundle_base, markers::TOOL_NAME)?;

        let cache_dir = match schema {
            CacheSchema::Flat => bundle_base.to_path_buf(),
            CacheSchema::Nested => bundle_base.join("cache"),
        };
        let layout = Self {
            install_base: install_base.to_path_buf(),
            bundle_base: bundle_base.to_path_buf(),
            cache_dir,
            format,
            schema,
            _lock: lock,
        };

        if schema == CacheSchema::Nested {
            let valid = layout.cache_valid_path();
            if valid.exists() {
                remove_file_if_exists(&valid)?;
            } else if layout.cache_dir.exists() {
                info!("Cache is not valid. Clearing cache...");
                remove_dir_if_exists(&layout.cache_dir)?;
            }
            fs::create_dir_all(&layout.cache_dir).io_context(|| {
                format!("Failed to create directory: {}", layout.cache_dir.display())
            })?;
        }
        debug!(
            "Bundle directory {} (format {}, {:?} cache)",
            bundle_base.display(),
            format,
            schema
        );
        Ok(layout)
    }

    pub fn install_base(&self) -> &Path {
        &self.install_base
    }

    pub fn bundle_base(&self) -> &Path {
        &self.bundle_base
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn format(&self) -> BundleFormat {
        self.format
    }

    pub fn schema(&self) -> CacheSchema {
        self.schema
    }

    /// Directory the installers install into.
    pub fn dependencies_staging_path(&self) -> PathBuf {
        self.cache_dir.join("bundle_staging")
    }

    pub fn dependencies_overlay_path(&self) -> PathBuf {
        self.cache_dir.join("dependencies.tar.gz")
    }

    /// Installer results accepted with the last successful run.
    pub fn installer_metadata_path(&self) -> PathBuf {
        self.cache_dir.join("installer_metadata.json")
    }

    /// Installer results recorded by the current run.
    pub fn installer_metadata_cache_path(&self) -> PathBuf {
        self.cache_dir.join("installer_metadata_cache.json")
    }

    /// Per-installer scratch directories live below this one.
    pub fn installer_cache_path(&self) -> PathBuf {
        self.cache_dir.join("installer_cache")
    }

    pub fn bundle_tar_path(&self) -> PathBuf {
        self.cache_dir.join("bundle.tar")
    }

    pub fn metadata_tar_path(&self) -> PathBuf {
        self.cache_dir.join("metadata.tar")
    }

    pub fn version_file_path(&self) -> PathBuf {
        self.cache_dir.join("version")
    }

    pub fn workspace_staging_path(&self) -> PathBuf {
        self.cache_dir.join("workspace_staging")
    }

    pub fn workspace_overlay_path(&self) -> PathBuf {
        self.cache_dir.join("workspace.tar.gz")
    }

    /// Fingerprint accepted after the last successful run.
    pub fn dependency_hash_path(&self) -> PathBuf {
        self.cache_dir.join("dependency_hash.json")
    }

    /// Fingerprint computed by the current run.
    pub fn dependency_hash_cache_path(&self) -> PathBuf {
        self.cache_dir.join("dependency_hash_cache.json")
    }

    pub fn bundle_v1_output_path(&self) -> PathBuf {
        self.bundle_base.join("output.tar.gz")
    }

    pub fn bundle_v2_output_path(&self) -> PathBuf {
        self.bundle_base.join("output.tar")
    }

    /// Final output for the format this layout was opened with.
    pub fn output_path(&self) -> PathBuf {
        match self.format {
            BundleFormat::V1 => self.bundle_v1_output_path(),
            BundleFormat::V2 => self.bundle_v2_output_path(),
        }
    }

    pub fn sources_tar_gz_path(&self) -> PathBuf {
        self.bundle_base.join("sources.tar.gz")
    }

    pub fn cache_valid_path(&self) -> PathBuf {
        self.cache_dir.join(".valid")
    }

    /// Record that the cache matches the bundle that was just written.
    pub fn mark_cache_valid(&self) -> BundleResult<()> {
        let path = self.cache_valid_path();
        fs::write(&path, b"").io_context(|| format!("Failed to write {}", path.display()))
    }
}

fn create_bundle_dir(path: &Path) -> BundleResult<()> {
    fs::create_dir_all(path)
        .io_context(|| format!("Failed to create directory: {}", path.display()))?;
    let ignore = path.join(IGNORE_MARKER);
    if !ignore.exists() && !ignore.is_symlink() {
        fs::write(&ignore, b"").io_context(|| format!("Failed to write {}", ignore.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::markers::{CACHE_VERSION_MARKER, FORMAT_VERSION_MARKER, TOOL_MARKER};
    use super::*;
    use tempfile::TempDir;

    fn all_paths(layout: &CacheLayout) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let intermediate = vec![
            layout.dependency_hash_path(),
            layout.installer_cache_path(),
            layout.dependency_hash_cache_path(),
            layout.dependencies_overlay_path(),
            layout.bundle_tar_path(),
            layout.installer_metadata_path(),
            layout.installer_metadata_cache_path(),
            layout.metadata_tar_path(),
            layout.dependencies_staging_path(),
            layout.version_file_path(),
            layout.workspace_staging_path(),
            layout.workspace_overlay_path(),
        ];
        let outputs = vec![
            layout.bundle_v1_output_path(),
            layout.bundle_v2_output_path(),
            layout.sources_tar_gz_path(),
        ];
        (intermediate, outputs)
    }

    fn first_component(base: &Path, path: &Path) -> String {
        path.strip_prefix(base)
            .unwrap()
            .components()
            .next()
            .unwrap()
            .as_os_str()
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn new_directory_uses_nested_cache() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        let layout = CacheLayout::open(&tmp.path().join("install"), &bundle, BundleFormat::V2).unwrap();

        assert_eq!(layout.schema(), CacheSchema::Nested);
        assert!(bundle.join(IGNORE_MARKER).is_file());
        assert!(bundle.join("cache").is_dir());
        let (intermediate, outputs) = all_paths(&layout);
        for p in intermediate {
            assert_eq!(first_component(&bundle, &p), "cache", "{}", p.display());
        }
        for p in outputs {
            assert_ne!(first_component(&bundle, &p), "cache", "{}", p.display());
        }
        assert_eq!(fs::read_to_string(bundle.join(TOOL_MARKER)).unwrap(), "bundle-builder\n");
        assert_eq!(fs::read_to_string(bundle.join(FORMAT_VERSION_MARKER)).unwrap(), "2\n");
        assert_eq!(fs::read_to_string(bundle.join(CACHE_VERSION_MARKER)).unwrap(), "2\n");
    }

    #[test]
    fn legacy_directory_keeps_flat_cache() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        fs::create_dir_all(&bundle).unwrap();
        let layout = CacheLayout::open(&tmp.path().join("install"), &bundle, BundleFormat::V1).unwrap();

        assert_eq!(layout.schema(), CacheSchema::Flat);
        assert!(!bundle.join("cache").exists());
        assert!(!bundle.join(IGNORE_MARKER).exists());
        let (intermediate, outputs) = all_paths(&layout);
        for p in intermediate.iter().chain(&outputs) {
            assert_ne!(first_component(&bundle, p), "cache", "{}", p.display());
        }
        assert_eq!(layout.output_path(), bundle.join("output.tar.gz"));
    }

    #[test]
    fn format_one_directory_rejects_format_two() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        drop(CacheLayout::open(tmp.path(), &bundle, BundleFormat::V1).unwrap());
        let err = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap_err();
        assert!(matches!(err, BundleError::IncompatibleCache { .. }));
    }

    #[test]
    fn foreign_tool_marker_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        fs::create_dir_all(&bundle).unwrap();
        fs::write(bundle.join(FORMAT_VERSION_MARKER), "2\n").unwrap();
        fs::write(bundle.join(TOOL_MARKER), "other-tool\n").unwrap();
        let err = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap_err();
        assert!(matches!(err, BundleError::IncompatibleCache { .. }));
    }

    #[test]
    fn unfinished_cache_is_cleared() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        let layout = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap();
        fs::write(layout.dependencies_overlay_path(), b"stale").unwrap();
        drop(layout);

        let layout = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap();
        assert!(!layout.dependencies_overlay_path().exists());
        assert!(layout.cache_dir().is_dir());
    }

    #[test]
    fn valid_cache_is_kept_and_sentinel_consumed() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        let layout = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap();
        fs::write(layout.dependencies_overlay_path(), b"kept").unwrap();
        layout.mark_cache_valid().unwrap();
        drop(layout);

        let layout = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap();
        assert_eq!(fs::read(layout.dependencies_overlay_path()).unwrap(), b"kept");
        assert!(!layout.cache_valid_path().exists());
    }

    #[test]
    fn concurrent_open_is_locked() {
        let tmp = TempDir::new().unwrap();
        let bundle = tmp.path().join("bundle");
        let _held = CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2).unwrap();
        assert!(matches!(
            CacheLayout::open(tmp.path(), &bundle, BundleFormat::V2),
            Err(BundleError::Locked { .. })
        ));
    }

    #[test]
    fn format_from_number() {
        assert_eq!(BundleFormat::try_from(1).unwrap(), BundleFormat::V1);
        assert_eq!(BundleFormat::try_from(2).unwrap(), BundleFormat::V2);
        assert!(BundleFormat::try_from(3).is_err());
    }
}
