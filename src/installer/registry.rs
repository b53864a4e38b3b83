use super::pip::Pip3Installer;
use super::Installer;
use crate::error::{BundleError, BundleResult};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Builds an installer from its `[installers.<name>]` settings table.
pub type InstallerFactory = Box<dyn Fn(&toml::Table) -> anyhow::Result<Box<dyn Installer>>>;

/// Name to constructor table for the installers a manifest may enable.
pub struct InstallerRegistry {
    factories: BTreeMap<String, InstallerFactory>,
}

impl std::fmt::Debug for InstallerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl Default for InstallerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl InstallerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the installers shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(Pip3Installer::NAME, |settings| {
            Ok(Box::new(Pip3Installer::from_settings(settings)?))
        });
        registry
    }

    /// Add or replace the constructor for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&toml::Table) -> anyhow::Result<Box<dyn Installer>> + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn instantiate(&self, name: &str, settings: &toml::Table) -> BundleResult<Box<dyn Installer>> {
        let factory = self.factories.get(name).ok_or_else(|| BundleError::Config {
            path: PathBuf::from(format!("installers.{name}")),
            reason: format!(
                "unknown installer '{name}' (available: {})",
                self.factories.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
        })?;
        factory(settings).map_err(|e| BundleError::installer(name, e))
    }

    /// Instantiate every configured installer.
    pub fn instantiate_all(
        &self,
        configured: &BTreeMap<String, toml::Table>,
    ) -> BundleResult<Vec<(String, Box<dyn Installer>)>> {
        configured
            .iter()
            .map(|(name, settings)| Ok((name.clone(), self.instantiate(name, settings)?)))
            .collect()
    }
}
