//! Final archive assembly.
//!
//! Format 1 always rebuilds one monolithic archive. Format 2 builds a
//! container of two overlays and only rebuilds the dependencies overlay when
//! asked to.

pub mod scripts;
mod v1;
mod v2;

use crate::error::BundleResult;
use crate::layout::{BundleFormat, CacheLayout};
use std::path::PathBuf;

/// Inputs the assembler takes from change detection.
#[derive(Debug, Clone, Default)]
pub struct ArchiveRequest {
    /// Re-archive the dependency staging directory. Ignored by format 1.
    pub rebuild_dependencies: bool,
    /// Installer results describing the dependencies this bundle carries.
    pub installer_metadata: PathBuf,
}

/// Build the bundle for the layout's format and return its path.
pub fn generate_archive(layout: &CacheLayout, request: &ArchiveRequest) -> BundleResult<PathBuf> {
    match layout.format() {
        BundleFormat::V1 => v1::generate_archive(layout, request),
        BundleFormat::V2 => v2::generate_archive(layout, request),
    }
}
