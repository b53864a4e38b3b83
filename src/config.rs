//! `bundle.toml` workspace manifest.
//!
//! ```toml
//! [bundle]
//! format_version = 2
//! default_installer = "pip3"
//!
//! [[package]]
//! name = "talker"
//! run_depends = ["pip3:numpy==1.16.0", "listener", "foo==1.0"]
//!
//! [installers.pip3]
//! pip_args = ["--no-cache-dir"]
//! ```
//!
//! Relative paths resolve against the manifest's directory.

use crate::error::{BundleError, BundleResult, IoContext};
use crate::layout::BundleFormat;
use crate::pipeline::BundleOptions;
use crate::workspace::{RunDependency, WorkspacePackage};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "bundle.toml";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleToml {
    #[serde(default)]
    bundle: BundleSectionToml,
    #[serde(default)]
    package: Vec<PackageToml>,
    #[serde(default)]
    installers: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BundleSectionToml {
    format_version: Option<u32>,
    include_sources: Option<bool>,
    upgrade: Option<bool>,
    default_installer: Option<String>,
    install_base: Option<PathBuf>,
    bundle_base: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    name: String,
    #[serde(default)]
    run_depends: Vec<String>,
    selected: Option<bool>,
}

/// A validated manifest.
#[derive(Debug, Clone)]
pub struct BundleConfig {
    pub path: PathBuf,
    pub options: BundleOptions,
    pub packages: Vec<WorkspacePackage>,
    /// Enabled installers and their settings tables.
    pub installers: BTreeMap<String, toml::Table>,
}

pub fn load_config(config_path: &Path) -> BundleResult<BundleConfig> {
    let text = fs::read_to_string(config_path)
        .io_context(|| format!("Failed to read bundle config '{}'", config_path.display()))?;
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&text, config_path, base)
}

/// Parse manifest `text`; `base` anchors relative paths.
pub fn parse_config(text: &str, config_path: &Path, base: &Path) -> BundleResult<BundleConfig> {
    let invalid = |reason: String| BundleError::Config {
        path: config_path.to_path_buf(),
        reason,
    };
    let parsed: BundleToml = toml::from_str(text).map_err(|e| invalid(e.to_string()))?;
    let section = parsed.bundle;

    let format = BundleFormat::try_from(section.format_version.unwrap_or(2)).map_err(|_| {
        invalid(format!(
            "format_version must be 1 or 2, got {}",
            section.format_version.unwrap_or_default()
        ))
    })?;

    let default_installer = section
        .default_installer
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(name) = &default_installer {
        if !parsed.installers.contains_key(name) {
            return Err(invalid(format!(
                "default_installer '{name}' has no [installers.{name}] section"
            )));
        }
    }

    let mut seen = BTreeSet::new();
    let mut packages = Vec::with_capacity(parsed.package.len());
    for pkg in parsed.package {
        let name = pkg.name.trim().to_string();
        if name.is_empty() {
            return Err(invalid("package with empty name".to_string()));
        }
        if !seen.insert(name.clone()) {
            return Err(invalid(format!("package '{name}' is declared twice")));
        }
        let run_depends = pkg
            .run_depends
            .iter()
            .filter(|d| !d.trim().is_empty())
            .map(|d| RunDependency::parse(d))
            .collect::<Vec<_>>();
        for dep in &run_depends {
            if let Some(installer) = &dep.installer {
                if !parsed.installers.contains_key(installer) {
                    return Err(invalid(format!(
                        "package '{name}' depends on '{dep}' but installer '{installer}' is not enabled"
                    )));
                }
            }
        }
        packages.push(WorkspacePackage {
            name,
            run_depends,
            selected: pkg.selected.unwrap_or(true),
        });
    }

    let resolve = |p: Option<PathBuf>, default: &str| -> PathBuf {
        let p = p.unwrap_or_else(|| PathBuf::from(default));
        if p.is_absolute() {
            p
        } else {
            base.join(p)
        }
    };

    let options = BundleOptions {
        install_base: resolve(section.install_base, "install"),
        bundle_base: resolve(section.bundle_base, "bundle"),
        format,
        include_sources: section.include_sources.unwrap_or(false),
        upgrade: section.upgrade.unwrap_or(false),
        default_installer,
    };

    Ok(BundleConfig {
        path: config_path.to_path_buf(),
        options,
        packages,
        installers: parsed.installers,
    })
}
