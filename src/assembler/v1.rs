//! Legacy single-archive bundle.
//!
//! ```text
//! output.tar.gz
//!  |- version        "1"
//!  |- metadata.tar   installers.json
//!  |- bundle.tar     dependency staging + opt/install
//! ```

use super::scripts::{install_setup_scripts, ScriptKind};
use super::ArchiveRequest;
use crate::artifact::filesystem::{copy_dir_recursive, remove_dir_if_exists, remove_file_if_exists};
use crate::artifact::{create_tar, create_tar_of_files};
use crate::error::{BundleResult, IoContext};
use crate::layout::CacheLayout;
use std::fs;
use std::path::PathBuf;
use tracing::info;

pub(super) fn generate_archive(
    layout: &CacheLayout,
    request: &ArchiveRequest,
) -> BundleResult<PathBuf> {
    let staging = layout.dependencies_staging_path();
    info!("Copying {} into bundle...", layout.install_base().display());
    install_setup_scripts(&staging, ScriptKind::Legacy)?;
    let workspace = staging.join("opt").join("install");
    remove_dir_if_exists(&workspace)?;
    copy_dir_recursive(layout.install_base(), &workspace)?;

    info!("Archiving the bundle output");
    println!("Creating bundle archive...");

    let metadata_tar = layout.metadata_tar_path();
    let bundle_tar = layout.bundle_tar_path();
    let version_file = layout.version_file_path();
    let output = layout.bundle_v1_output_path();

    create_tar_of_files(
        &metadata_tar,
        &[(request.installer_metadata.clone(), "installers.json".to_string())],
        false,
    )?;
    create_tar(&staging, &bundle_tar)?;
    fs::write(&version_file, b"1")
        .io_context(|| format!("Failed to write {}", version_file.display()))?;

    create_tar_of_files(
        &output,
        &[
            (version_file, "version".to_string()),
            (metadata_tar.clone(), "metadata.tar".to_string()),
            (bundle_tar.clone(), "bundle.tar".to_string()),
        ],
        true,
    )?;

    remove_file_if_exists(&metadata_tar)?;
    remove_file_if_exists(&bundle_tar)?;
    info!("Archiving complete");
    Ok(output)
}
