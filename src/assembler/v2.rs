use super::scripts::{install_setup_scripts, ScriptKind};
use super::ArchiveRequest;
use crate::artifact::create_tar_gz;
use crate::artifact::filesystem::{copy_dir_recursive, remove_dir_if_exists};
use crate::bundle::{check_metadata_size, BundleWriter};
use crate::error::{BundleError, BundleResult};
use crate::installer::metadata::INSTALLER_METADATA_FILE;
use crate::layout::CacheLayout;
use std::path::PathBuf;
use tracing::info;

pub(super) fn generate_archive(
    layout: &CacheLayout,
    request: &ArchiveRequest,
) -> BundleResult<PathBuf> {
    info!("Archiving the bundle output");
    println!("Creating bundle archive V2...");

    let workspace_overlay = layout.workspace_overlay_path();
    let dependencies_overlay = layout.dependencies_overlay_path();
    let metadata = [(
        request.installer_metadata.clone(),
        INSTALLER_METADATA_FILE.to_string(),
    )];
    check_metadata_size(
        &metadata,
        &[dependencies_overlay.clone(), workspace_overlay.clone()],
    )?;

    let workspace_staging = layout.workspace_staging_path();
    remove_dir_if_exists(&workspace_staging)?;
    install_setup_scripts(&workspace_staging, ScriptKind::Workspace)?;
    copy_dir_recursive(
        layout.install_base(),
        &workspace_staging.join("opt").join("built_workspace"),
    )?;
    create_tar_gz(&workspace_staging, &workspace_overlay)?;

    if request.rebuild_dependencies {
        info!(
            "Dependencies changed, updating {}",
            dependencies_overlay.display()
        );
        let staging = layout.dependencies_staging_path();
        install_setup_scripts(&staging, ScriptKind::Dependencies)?;
        create_tar_gz(&staging, &dependencies_overlay)?;
    } else if !dependencies_overlay.is_file() {
        return Err(BundleError::InvalidState(format!(
            "dependencies overlay {} is missing and was not scheduled for rebuild",
            dependencies_overlay.display()
        )));
    } else {
        info!("Reusing {}", dependencies_overlay.display());
    }

    let output = layout.bundle_v2_output_path();
    let mut bundle = BundleWriter::create(&output);
    for (path, name) in &metadata {
        bundle.add_metadata_as(path, name.as_str())?;
    }
    bundle.add_overlay_archive(&dependencies_overlay)?;
    bundle.add_overlay_archive(&workspace_overlay)?;
    bundle.close()?;

    info!("Archiving complete");
    println!("Archiving complete!");
    Ok(output)
}
