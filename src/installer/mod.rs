//! Dependency installers.
//!
//! An [`Installer`] resolves a list of package specs and installs them into
//! the shared dependency staging directory. Installers are created from the
//! [`registry::InstallerRegistry`] by name and driven through an
//! [`InstallerManager`], which owns their per-installer cache directories.

pub mod metadata;
pub mod pip;
pub mod registry;

use crate::artifact::create_tar_of_files;
use crate::error::{BundleError, BundleResult, IoContext};
use crate::layout::CacheLayout;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory inside an installer cache whose files go into the sources
/// archive.
pub const SOURCES_DIR: &str = "sources";

/// What an installer gets to work with.
#[derive(Debug, Clone)]
pub struct InstallerContext {
    /// Private scratch directory, kept between runs.
    pub cache_path: PathBuf,
    /// Root every installer installs into.
    pub prefix_path: PathBuf,
    pub include_sources: bool,
    /// Resolve versions again instead of reusing a cached install.
    pub upgrade: bool,
}

pub trait Installer {
    fn initialize(&mut self, context: &InstallerContext) -> anyhow::Result<()>;

    /// Queue `name` for installation. `metadata` is installer specific.
    fn add_to_install_list(&mut self, name: &str, metadata: Option<&Value>);

    fn remove_from_install_list(&mut self, name: &str, metadata: Option<&Value>);

    /// Install everything queued and describe the result.
    ///
    /// The returned value lands in the bundle's installer metadata and is
    /// compared across runs, so it must be stable for an unchanged install.
    fn install(&mut self) -> anyhow::Result<Value>;

    /// Whether the installer's own inputs changed since its last install.
    fn cache_invalid(&self) -> bool {
        false
    }
}

/// Installers active for one run, keyed (and run) by name.
pub struct InstallerManager {
    prefix_path: PathBuf,
    cache_root: PathBuf,
    installers: BTreeMap<String, Box<dyn Installer>>,
    cache_dirs: BTreeMap<String, PathBuf>,
}

impl std::fmt::Debug for InstallerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallerManager")
            .field("prefix_path", &self.prefix_path)
            .field("installers", &self.installers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl InstallerManager {
    pub fn new(layout: &CacheLayout, installers: Vec<(String, Box<dyn Installer>)>) -> Self {
        Self {
            prefix_path: layout.dependencies_staging_path(),
            cache_root: layout.installer_cache_path(),
            installers: installers.into_iter().collect(),
            cache_dirs: BTreeMap::new(),
        }
    }

    pub fn prefix_path(&self) -> &Path {
        &self.prefix_path
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.installers.keys().map(String::as_str)
    }

    /// Create each installer's cache directory and initialize it.
    pub fn setup(&mut self, include_sources: bool, upgrade: bool) -> BundleResult<()> {
        fs::create_dir_all(&self.prefix_path).io_context(|| {
            format!("Failed to create directory: {}", self.prefix_path.display())
        })?;
        for (name, installer) in &mut self.installers {
            let cache_path = self.cache_root.join(name);
            fs::create_dir_all(&cache_path)
                .io_context(|| format!("Failed to create directory: {}", cache_path.display()))?;
            let context = InstallerContext {
                cache_path: cache_path.clone(),
                prefix_path: self.prefix_path.clone(),
                include_sources,
                upgrade,
            };
            installer
                .initialize(&context)
                .map_err(|e| BundleError::installer(name.as_str(), e))?;
            debug!("Initialized installer {name} ({})", cache_path.display());
            self.cache_dirs.insert(name.clone(), cache_path);
        }
        Ok(())
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Box<dyn Installer>> {
        self.installers.get_mut(name)
    }

    /// True if any installer wants to run again regardless of fingerprints.
    pub fn cache_invalid(&self) -> bool {
        self.installers.iter().any(|(name, installer)| {
            let invalid = installer.cache_invalid();
            if invalid {
                info!("Installer {name} reports its cache is invalid");
            }
            invalid
        })
    }

    /// Run every installer and collect its result under its name.
    pub fn run_installers(&mut self) -> BundleResult<BTreeMap<String, Value>> {
        println!("Fetching and installing dependencies...");
        info!("Fetching and installing dependencies...");
        let mut results = BTreeMap::new();
        for (name, installer) in &mut self.installers {
            let result = installer
                .install()
                .map_err(|e| BundleError::installer(name.as_str(), e))?;
            results.insert(name.clone(), result);
        }
        Ok(results)
    }

    /// Archive every installer's `sources/` files as `<installer>/<file>`.
    pub fn write_sources_archive(&self, out_path: &Path) -> BundleResult<usize> {
        let mut files = vec![];
        for (name, dir) in &self.cache_dirs {
            let sources = dir.join(SOURCES_DIR);
            if !sources.is_dir() {
                continue;
            }
            let mut entries = vec![];
            for entry in fs::read_dir(&sources)
                .io_context(|| format!("Failed to read directory: {}", sources.display()))?
            {
                let entry =
                    entry.io_context(|| format!("Failed to read entry in {}", sources.display()))?;
                if entry.path().is_file() {
                    entries.push(entry.file_name().to_string_lossy().into_owned());
                }
            }
            entries.sort();
            for file in entries {
                files.push((sources.join(&file), format!("{name}/{file}")));
            }
        }
        create_tar_of_files(out_path, &files, true)?;
        info!("Wrote {} source file(s) to {}", files.len(), out_path.display());
        Ok(files.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BundleFormat;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorded {
        queued: Vec<String>,
        context: Option<InstallerContext>,
    }

    struct Recording {
        state: Rc<RefCell<Recorded>>,
        fail: bool,
    }

    impl Installer for Recording {
        fn initialize(&mut self, context: &InstallerContext) -> anyhow::Result<()> {
            self.state.borrow_mut().context = Some(context.clone());
            Ok(())
        }

        fn add_to_install_list(&mut self, name: &str, _metadata: Option<&Value>) {
            self.state.borrow_mut().queued.push(name.to_string());
        }

        fn remove_from_install_list(&mut self, name: &str, _metadata: Option<&Value>) {
            self.state.borrow_mut().queued.retain(|n| n != name);
        }

        fn install(&mut self) -> anyhow::Result<Value> {
            if self.fail {
                anyhow::bail!("network unreachable");
            }
            let context = self.state.borrow().context.clone();
            if let Some(context) = context {
                if context.include_sources {
                    let sources = context.cache_path.join(SOURCES_DIR);
                    fs::create_dir_all(&sources)?;
                    fs::write(sources.join("foo-1.0.tar.gz"), b"sdist")?;
                }
            }
            Ok(json!({"installed": self.state.borrow().queued}))
        }
    }

    fn manager(tmp: &TempDir, fail: bool) -> (CacheLayout, InstallerManager, Rc<RefCell<Recorded>>) {
        let layout =
            CacheLayout::open(tmp.path(), &tmp.path().join("bundle"), BundleFormat::V2).unwrap();
        let state = Rc::new(RefCell::new(Recorded::default()));
        let installer = Recording {
            state: state.clone(),
            fail,
        };
        let manager = InstallerManager::new(&layout, vec![("fake".into(), Box::new(installer))]);
        (layout, manager, state)
    }

    #[test]
    fn setup_creates_cache_dirs_and_passes_context() {
        let tmp = TempDir::new().unwrap();
        let (layout, mut manager, state) = manager(&tmp, false);
        manager.setup(false, true).unwrap();

        let context = state.borrow().context.clone().unwrap();
        assert!(context.upgrade);
        assert!(!context.include_sources);
        assert_eq!(context.cache_path, layout.installer_cache_path().join("fake"));
        assert_eq!(context.prefix_path, layout.dependencies_staging_path());
        assert!(context.cache_path.is_dir());
        assert!(manager.prefix_path().is_dir());
    }

    #[test]
    fn results_are_keyed_by_installer() {
        let tmp = TempDir::new().unwrap();
        let (_layout, mut manager, _state) = manager(&tmp, false);
        manager.setup(false, false).unwrap();
        let installer = manager.get_mut("fake").unwrap();
        installer.add_to_install_list("foo==1.0", None);
        installer.add_to_install_list("bar", None);
        installer.remove_from_install_list("bar", None);

        let results = manager.run_installers().unwrap();
        assert_eq!(results["fake"], json!({"installed": ["foo==1.0"]}));
        assert!(!manager.cache_invalid());
    }

    #[test]
    fn failure_names_installer() {
        let tmp = TempDir::new().unwrap();
        let (_layout, mut manager, _state) = manager(&tmp, true);
        manager.setup(false, false).unwrap();
        let err = manager.run_installers().unwrap_err();
        assert!(matches!(err, BundleError::Installer { ref installer, .. } if installer == "fake"));
    }

    #[test]
    fn sources_archive_prefixes_installer_name() {
        let tmp = TempDir::new().unwrap();
        let (layout, mut manager, _state) = manager(&tmp, false);
        manager.setup(true, false).unwrap();
        manager.run_installers().unwrap();

        let out = layout.sources_tar_gz_path();
        assert_eq!(manager.write_sources_archive(&out).unwrap(), 1);
        let mut archive =
            tar::Archive::new(flate2::read::GzDecoder::new(fs::File::open(&out).unwrap()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["fake/foo-1.0.tar.gz"]);
    }
}
