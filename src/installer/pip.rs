//! Python packages through `pip`.

use super::{Installer, InstallerContext, SOURCES_DIR};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{info, warn};

const REQUIREMENTS_FILE: &str = "requirements";
const METADATA_FILE: &str = "metadata";
const PIP_ARGS_FILE: &str = "pip_args";

/// `[installers.pip3]` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Pip3Settings {
    /// Extra arguments for `pip install`.
    pub pip_args: Vec<String>,
    /// Interpreter to run pip with. Defaults to `<prefix>/usr/bin/python3`
    /// when present, then `python3` on PATH.
    pub python: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipMetadata {
    pub installed_packages: Vec<InstalledPackage>,
}

/// Installs requirement specs into `<prefix>/usr` with
/// `pip install --ignore-installed --prefix`.
#[derive(Debug, Default)]
pub struct Pip3Installer {
    settings: Pip3Settings,
    packages: Vec<String>,
    cache_path: PathBuf,
    prefix_path: PathBuf,
    python: PathBuf,
    include_sources: bool,
    upgrade: bool,
    args_changed: bool,
}

impl Pip3Installer {
    pub const NAME: &'static str = "pip3";

    pub fn new(settings: Pip3Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    pub fn from_settings(settings: &toml::Table) -> Result<Self> {
        let settings: Pip3Settings = toml::Value::Table(settings.clone())
            .try_into()
            .context("Invalid [installers.pip3] settings")?;
        Ok(Self::new(settings))
    }

    fn requirements_path(&self) -> PathBuf {
        self.cache_path.join(REQUIREMENTS_FILE)
    }

    fn metadata_path(&self) -> PathBuf {
        self.cache_path.join(METADATA_FILE)
    }

    fn pip_args_line(&self) -> String {
        self.settings.pip_args.join(" ")
    }

    /// Metadata from the previous install when it covered exactly the
    /// requested packages. Never reused in upgrade mode.
    fn cached_metadata(&self) -> Result<Option<Value>> {
        let requirements = self.requirements_path();
        let metadata = self.metadata_path();
        if self.upgrade || self.args_changed || !requirements.is_file() || !metadata.is_file() {
            return Ok(None);
        }
        let mut previous: Vec<String> = fs::read_to_string(&requirements)
            .with_context(|| format!("Failed to read {}", requirements.display()))?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        previous.sort();
        let mut requested: Vec<String> = self.packages.iter().map(|p| p.trim().to_string()).collect();
        requested.sort();
        if previous != requested {
            return Ok(None);
        }
        let text = fs::read_to_string(&metadata)
            .with_context(|| format!("Failed to read {}", metadata.display()))?;
        Ok(Some(serde_json::from_str(&text).with_context(|| {
            format!("Failed to parse {}", metadata.display())
        })?))
    }

    fn pip(&self) -> Command {
        let mut cmd = Command::new(&self.python);
        cmd.arg("-m").arg("pip");
        cmd
    }

    fn freeze(&self) -> Result<PipMetadata> {
        let site_dirs = site_packages_dirs(&self.prefix_path.join("usr"))?;
        if site_dirs.is_empty() {
            return Ok(PipMetadata::default());
        }
        let mut cmd = self.pip();
        cmd.arg("freeze");
        for dir in &site_dirs {
            cmd.arg("--path").arg(dir);
        }
        let stdout = run_checked(&mut cmd, "pip freeze")?;
        Ok(PipMetadata {
            installed_packages: parse_freeze(&stdout),
        })
    }
}

impl Installer for Pip3Installer {
    fn initialize(&mut self, context: &InstallerContext) -> Result<()> {
        self.cache_path = context.cache_path.clone();
        self.prefix_path = context.prefix_path.clone();
        self.include_sources = context.include_sources;
        self.upgrade = context.upgrade;

        self.python = match &self.settings.python {
            Some(python) => python.clone(),
            None => {
                let bundled = self.prefix_path.join("usr/bin/python3");
                if bundled.is_file() {
                    bundled
                } else {
                    which::which("python3").context("python3 not found on PATH")?
                }
            }
        };

        let args_file = self.cache_path.join(PIP_ARGS_FILE);
        self.args_changed = match fs::read_to_string(&args_file) {
            Ok(previous) => previous.trim_end() != self.pip_args_line(),
            Err(_) => false,
        };
        Ok(())
    }

    fn add_to_install_list(&mut self, name: &str, _metadata: Option<&Value>) {
        self.packages.push(name.to_string());
    }

    fn remove_from_install_list(&mut self, name: &str, _metadata: Option<&Value>) {
        self.packages.retain(|p| p != name);
    }

    fn install(&mut self) -> Result<Value> {
        if self.packages.is_empty() {
            info!("No dependencies to install for {}", Self::NAME);
            return Ok(serde_json::to_value(PipMetadata::default())?);
        }
        if let Some(metadata) = self.cached_metadata()? {
            info!("No changes detected for {}", Self::NAME);
            return Ok(metadata);
        }

        info!("Installing {} dependencies...", Self::NAME);
        let requirements = self.requirements_path();
        let mut contents = String::new();
        for name in &self.packages {
            contents.push_str(name.trim());
            contents.push('\n');
        }
        fs::write(&requirements, contents)
            .with_context(|| format!("Failed to write {}", requirements.display()))?;

        let mut cmd = self.pip();
        cmd.arg("install")
            .args(&self.settings.pip_args)
            .arg("--default-timeout=100")
            .arg("--ignore-installed")
            .arg("--prefix")
            .arg(self.prefix_path.join("usr"))
            .arg("-r")
            .arg(&requirements);
        run_checked(&mut cmd, "pip install")?;

        if self.include_sources {
            let mut cmd = self.pip();
            cmd.arg("download")
                .arg("--no-binary")
                .arg(":all:")
                .arg("-d")
                .arg(self.cache_path.join(SOURCES_DIR))
                .arg("-r")
                .arg(&requirements);
            run_checked(&mut cmd, "pip download")?;
        }

        let metadata = serde_json::to_value(self.freeze()?)?;
        let metadata_path = self.metadata_path();
        fs::write(&metadata_path, serde_json::to_string(&metadata)?)
            .with_context(|| format!("Failed to write {}", metadata_path.display()))?;
        let args_file = self.cache_path.join(PIP_ARGS_FILE);
        fs::write(&args_file, format!("{}\n", self.pip_args_line()))
            .with_context(|| format!("Failed to write {}", args_file.display()))?;
        self.args_changed = false;
        Ok(metadata)
    }

    fn cache_invalid(&self) -> bool {
        self.args_changed
    }
}

fn run_checked(cmd: &mut Command, what: &str) -> Result<String> {
    let output = cmd
        .output()
        .with_context(|| format!("Failed to execute {what}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "{what} failed\n  Exit code: {}\n  stderr: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `lib/python3*/{site,dist}-packages` below `usr`, sorted.
fn site_packages_dirs(usr: &Path) -> Result<Vec<PathBuf>> {
    let lib = usr.join("lib");
    if !lib.is_dir() {
        return Ok(vec![]);
    }
    let mut dirs = vec![];
    for entry in fs::read_dir(&lib).with_context(|| format!("Failed to read {}", lib.display()))? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with("python3") {
            continue;
        }
        for leaf in ["site-packages", "dist-packages"] {
            let candidate = entry.path().join(leaf);
            if candidate.is_dir() {
                dirs.push(candidate);
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn parse_freeze(output: &str) -> Vec<InstalledPackage> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| match line.split_once("==") {
            Some((name, version)) => Some(InstalledPackage {
                name: name.to_string(),
                version: version.to_string(),
            }),
            None => {
                warn!("Ignoring pip freeze line without a pinned version: {line}");
                None
            }
        })
        .collect()
}
