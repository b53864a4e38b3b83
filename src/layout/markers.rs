//! Marker files recording who last used a bundle directory and how.
//!
//! Each marker holds a single line with a trailing newline.

use crate::artifact::filesystem::write_atomic;
use crate::error::{BundleError, BundleResult, IoContext};
use std::fs;
use std::path::Path;
use tracing::debug;

pub const TOOL_MARKER: &str = ".bundled_by";
pub const FORMAT_VERSION_MARKER: &str = ".bundle_version";
pub const CACHE_VERSION_MARKER: &str = ".bundle_cache_version";

/// Identity written into [`TOOL_MARKER`].
pub const TOOL_NAME: &str = env!("CARGO_PKG_NAME");

fn read_marker(path: &Path) -> BundleResult<Option<String>> {
    if !path.is_file() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).io_context(|| format!("Failed to read {}", path.display()))?;
    Ok(Some(contents.trim_end().to_string()))
}

fn write_marker(path: &Path, value: &str) -> BundleResult<()> {
    write_atomic(path, format!("{value}\n").as_bytes())
}

fn parse_version(path: &Path, raw: &str) -> BundleResult<u32> {
    raw.parse().map_err(|_| BundleError::IncompatibleCache {
        path: path.parent().unwrap_or(path).to_path_buf(),
        reason: format!("marker '{}' holds unreadable value '{raw}'", path.display()),
    })
}

/// Check the tool marker, writing it when absent.
///
/// A directory written by another tool is rejected.
pub fn check_and_mark_tool(bundle_base: &Path, this_tool: &str) -> BundleResult<()> {
    fs::create_dir_all(bundle_base)
        .io_context(|| format!("Failed to create directory: {}", bundle_base.display()))?;
    let marker = bundle_base.join(TOOL_MARKER);
    match read_marker(&marker)? {
        Some(previous) if previous == this_tool => Ok(()),
        Some(previous) => Err(BundleError::IncompatibleCache {
            path: bundle_base.to_path_buf(),
            reason: format!(
                "it was created by '{previous}'; remove the bundle directory or pick a different one"
            ),
        }),
        None => {
            debug!("Marking {} as bundled by {this_tool}", bundle_base.display());
            write_marker(&marker, this_tool)
        }
    }
}

/// Check the bundle format marker against `this_version`, then record it.
///
/// Directories bundled before the marker existed only ever held format 1.
pub fn check_and_mark_format_version(
    bundle_base: &Path,
    this_version: u32,
    previously_bundled: bool,
) -> BundleResult<()> {
    let marker = bundle_base.join(FORMAT_VERSION_MARKER);
    let previous = match read_marker(&marker)? {
        Some(raw) => Some(parse_version(&marker, &raw)?),
        None if previously_bundled => Some(1),
        None => None,
    };
    if let Some(previous) = previous {
        if previous != this_version {
            return Err(BundleError::IncompatibleCache {
                path: bundle_base.to_path_buf(),
                reason: format!(
                    "it holds a version {previous} bundle but version {this_version} was \
                     requested; use a new bundle directory or pass --bundle-version {previous}"
                ),
            });
        }
    }
    write_marker(&marker, &this_version.to_string())
}

/// Resolve and record the cache schema of `bundle_base`.
///
/// The marker wins when present; otherwise directories that were bundled
/// before get the flat schema 1 and new directories the nested schema 2.
pub fn get_and_mark_cache_version(bundle_base: &Path, previously_bundled: bool) -> BundleResult<u32> {
    let marker = bundle_base.join(CACHE_VERSION_MARKER);
    let version = match read_marker(&marker)? {
        Some(raw) => parse_version(&marker, &raw)?,
        None if previously_bundled => 1,
        None => 2,
    };
    write_marker(&marker, &version.to_string())?;
    Ok(version)
}
