//! End-to-end bundle run.
//!
//! ```text
//! CacheLayout::open ─> queue dependencies ─> fingerprint ─┐
//!                                                         ├─> installers? ─> metadata changed?
//!                          overlay / metadata present? ───┘                       │
//!                                   generate_archive(rebuild?) <──────────────────┘
//!                                   promote fingerprint and installer metadata,
//!                                   mark cache valid
//! ```
//!
//! The fingerprint and installer metadata are promoted and the cache marked
//! valid only after the bundle is closed, so a failed run is retried in full
//! next time. Installer results left pending by a failed run make the next
//! run invoke the installers again.

use crate::assembler::{generate_archive, ArchiveRequest};
use crate::error::{BundleError, BundleResult};
use crate::fingerprint::DependencyFingerprint;
use crate::installer::metadata::InstallerMetadataTracker;
use crate::installer::{Installer, InstallerManager};
use crate::layout::{BundleFormat, CacheLayout};
use crate::workspace::{queue_run_dependencies, WorkspacePackage};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BundleOptions {
    pub install_base: PathBuf,
    pub bundle_base: PathBuf,
    pub format: BundleFormat,
    pub include_sources: bool,
    /// Re-run installers even when nothing declared changed.
    pub upgrade: bool,
    /// Installer for dependencies without an `installer:` prefix.
    pub default_installer: Option<String>,
}

impl BundleOptions {
    pub fn new(install_base: impl Into<PathBuf>, bundle_base: impl Into<PathBuf>) -> Self {
        Self {
            install_base: install_base.into(),
            bundle_base: bundle_base.into(),
            format: BundleFormat::V2,
            include_sources: false,
            upgrade: false,
            default_installer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutcome {
    pub output_path: PathBuf,
    pub dependencies_changed: bool,
    pub installers_invoked: bool,
    pub dependencies_overlay_rebuilt: bool,
}

/// State observed before any installer runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSignals {
    pub dependencies_changed: bool,
    pub cache_invalid: bool,
    pub overlay_missing: bool,
    pub metadata_missing: bool,
    /// A previous run recorded installer results but never finished.
    pub metadata_pending: bool,
}

impl ChangeSignals {
    fn any(&self) -> bool {
        self.dependencies_changed
            || self.cache_invalid
            || self.overlay_missing
            || self.metadata_missing
            || self.metadata_pending
    }
}

/// Whether the installers have to run this time.
pub fn should_run_installers(format: BundleFormat, upgrade: bool, signals: &ChangeSignals) -> bool {
    match format {
        BundleFormat::V1 => true,
        BundleFormat::V2 => upgrade || signals.any(),
    }
}

/// Whether the dependencies overlay has to be re-archived once the
/// installers ran and reported `metadata_changed`.
///
/// In upgrade mode the installers run unconditionally, so only a change in
/// what they installed (or a missing overlay) triggers a rebuild.
pub fn should_rebuild_dependencies(
    format: BundleFormat,
    upgrade: bool,
    signals: &ChangeSignals,
    installers_invoked: bool,
    metadata_changed: bool,
) -> bool {
    match format {
        BundleFormat::V1 => true,
        BundleFormat::V2 if !installers_invoked => false,
        BundleFormat::V2 if upgrade => metadata_changed || signals.overlay_missing,
        BundleFormat::V2 => {
            metadata_changed
                || signals.dependencies_changed
                || signals.cache_invalid
                || signals.overlay_missing
        }
    }
}

/// Bundle `packages` from `options.install_base` into `options.bundle_base`
/// using `installers`.
pub fn run_bundle(
    options: &BundleOptions,
    packages: &[WorkspacePackage],
    installers: Vec<(String, Box<dyn Installer>)>,
) -> BundleResult<BundleOutcome> {
    if !options.install_base.is_dir() {
        return Err(BundleError::InvalidState(format!(
            "install base '{}' does not exist. You must build your workspace before bundling it",
            options.install_base.display()
        )));
    }
    println!("Bundling workspace...");
    let layout = CacheLayout::open(&options.install_base, &options.bundle_base, options.format)?;

    let mut manager = InstallerManager::new(&layout, installers);
    manager.setup(options.include_sources, options.upgrade)?;

    println!("Collecting dependency information...");
    let selected: Vec<&str> = packages
        .iter()
        .filter(|p| p.selected)
        .map(|p| p.name.as_str())
        .collect();
    info!("Including {selected:?} in bundle...");
    let queued = queue_run_dependencies(packages, &mut manager, options.default_installer.as_deref())?;
    debug!("Queued {queued} dependencies");

    let fingerprint = DependencyFingerprint::new(&layout);
    let tracker = InstallerMetadataTracker::new(&layout);
    let signals = ChangeSignals {
        dependencies_changed: fingerprint.has_changed(packages)?,
        cache_invalid: manager.cache_invalid(),
        overlay_missing: !layout.dependencies_overlay_path().is_file(),
        metadata_missing: !tracker.exists(),
        metadata_pending: tracker.has_pending(),
    };
    debug!("Change signals: {signals:?}");

    let installers_invoked = should_run_installers(options.format, options.upgrade, &signals);
    let mut metadata_changed = false;
    if installers_invoked {
        let results = manager.run_installers()?;
        metadata_changed = tracker.record_and_compare(&results)?;
        if metadata_changed {
            info!("Installer metadata changed");
        }
    } else {
        info!("Dependencies unchanged, skipping installers");
    }

    if options.include_sources {
        manager.write_sources_archive(&layout.sources_tar_gz_path())?;
    }

    let rebuild = should_rebuild_dependencies(
        options.format,
        options.upgrade,
        &signals,
        installers_invoked,
        metadata_changed,
    );
    let request = ArchiveRequest {
        rebuild_dependencies: rebuild,
        installer_metadata: tracker.current_path().to_path_buf(),
    };
    let output_path = generate_archive(&layout, &request)?;

    fingerprint.promote()?;
    tracker.promote()?;
    layout.mark_cache_valid()?;

    Ok(BundleOutcome {
        output_path,
        dependencies_changed: signals.dependencies_changed,
        installers_invoked,
        dependencies_overlay_rebuilt: rebuild,
    })
}
