//! Workspace packages and their run dependencies.

use crate::error::{BundleError, BundleResult};
use crate::installer::InstallerManager;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use tracing::debug;

/// A declared run dependency, optionally routed to a named installer
/// (`pip3:numpy==1.16.0`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RunDependency {
    pub installer: Option<String>,
    pub spec: String,
}

impl RunDependency {
    /// Parse `installer:spec` or a bare `spec`.
    ///
    /// Only a prefix made of name characters counts as an installer, so
    /// specs such as `pkg @ https://host/pkg.whl` stay bare.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Some((prefix, spec)) = raw.split_once(':') {
            let is_name = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if is_name && !spec.is_empty() {
                return Self {
                    installer: Some(prefix.to_string()),
                    spec: spec.to_string(),
                };
            }
        }
        Self {
            installer: None,
            spec: raw.to_string(),
        }
    }
}

impl fmt::Display for RunDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.installer {
            Some(installer) => write!(f, "{installer}:{}", self.spec),
            None => f.write_str(&self.spec),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePackage {
    pub name: String,
    pub run_depends: Vec<RunDependency>,
    /// Unselected packages take no part in fingerprinting or installation.
    pub selected: bool,
}

impl WorkspacePackage {
    pub fn new<I, S>(name: impl Into<String>, run_depends: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: name.into(),
            run_depends: run_depends
                .into_iter()
                .map(|d| RunDependency::parse(d.as_ref()))
                .collect(),
            selected: true,
        }
    }
}

/// Hand every selected package's external run dependencies to its
/// installer.
///
/// Bare dependencies naming a workspace package are skipped, the workspace
/// overlay already carries them. Other bare dependencies go to
/// `default_installer`.
pub fn queue_run_dependencies(
    packages: &[WorkspacePackage],
    manager: &mut InstallerManager,
    default_installer: Option<&str>,
) -> BundleResult<usize> {
    let workspace: BTreeSet<&str> = packages.iter().map(|p| p.name.as_str()).collect();
    let mut queued = 0;
    for package in packages.iter().filter(|p| p.selected) {
        for dep in &package.run_depends {
            let installer = match (&dep.installer, default_installer) {
                (Some(name), _) => name.as_str(),
                (None, _) if workspace.contains(dep.spec.as_str()) => continue,
                (None, Some(default)) => default,
                (None, None) => {
                    return Err(BundleError::Config {
                        path: Path::new(&package.name).to_path_buf(),
                        reason: format!(
                            "dependency '{}' names no installer and no default installer is set",
                            dep.spec
                        ),
                    })
                }
            };
            debug!("Queueing {} for {installer} ({})", dep.spec, package.name);
            manager
                .get_mut(installer)
                .ok_or_else(|| BundleError::Config {
                    path: Path::new(&package.name).to_path_buf(),
                    reason: format!("dependency '{dep}' needs unknown installer '{installer}'"),
                })?
                .add_to_install_list(&dep.spec, None);
            queued += 1;
        }
    }
    Ok(queued)
}
