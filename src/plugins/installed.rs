//! Persisted set of installed plugin system names
//!
//! # Storage
//! Names are stored as a JSON array in `installed_plugins.json`. Older hosts
//! wrote one name per line to `InstalledPlugins.txt`; that file is migrated
//! on first read and then deleted.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{PluginError, Result};
use super::fs::FileSystem;

pub const INSTALLED_PLUGINS_FILE_NAME: &str = "installed_plugins.json";
pub const LEGACY_INSTALLED_PLUGINS_FILE_NAME: &str = "InstalledPlugins.txt";

/// Installation state tracker
///
/// Every mutation reads the whole record, changes it and writes it back.
/// Mutations are serialized so concurrent callers never lose an update.
pub struct InstalledPlugins {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    legacy_path: PathBuf,
    guard: Mutex<()>,
}

impl InstalledPlugins {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>, path: PathBuf, legacy_path: PathBuf) -> Self {
        Self {
            fs,
            path,
            legacy_path,
            guard: Mutex::new(()),
        }
    }

    /// Tracker using the default file names inside `dir`
    #[must_use]
    pub fn in_dir(fs: Arc<dyn FileSystem>, dir: &Path) -> Self {
        Self::new(
            fs,
            dir.join(INSTALLED_PLUGINS_FILE_NAME),
            dir.join(LEGACY_INSTALLED_PLUGINS_FILE_NAME),
        )
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the installed names, migrating the legacy record if needed
    pub fn load_names(&self) -> Result<Vec<String>> {
        let _lock = self.guard.lock();
        self.read_names()
    }

    /// Whether `name` is recorded as installed
    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self
            .load_names()?
            .iter()
            .any(|installed| installed.eq_ignore_ascii_case(name)))
    }

    pub fn mark_installed(&self, name: &str) -> Result<()> {
        let _lock = self.guard.lock();
        let mut names = self.read_names()?;
        if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
            names.push(name.to_string());
        }
        self.write_names(&names)?;

        debug!("Marked plugin {} as installed", name);
        Ok(())
    }

    pub fn mark_uninstalled(&self, name: &str) -> Result<()> {
        let _lock = self.guard.lock();
        let mut names = self.read_names()?;
        names.retain(|n| !n.eq_ignore_ascii_case(name));
        self.write_names(&names)?;

        debug!("Marked plugin {} as uninstalled", name);
        Ok(())
    }

    /// Run `action` under the record lock unless `name` is installed
    ///
    /// Returns `None` without running `action` when the plugin is installed,
    /// so no `mark_installed` can land between the check and the action.
    pub fn unless_installed<T>(
        &self,
        name: &str,
        action: impl FnOnce() -> T,
    ) -> Result<Option<T>> {
        let _lock = self.guard.lock();
        if self
            .read_names()?
            .iter()
            .any(|installed| installed.eq_ignore_ascii_case(name))
        {
            return Ok(None);
        }
        Ok(Some(action()))
    }

    /// Forget every installed plugin by removing the record
    pub fn mark_all_uninstalled(&self) -> Result<()> {
        let _lock = self.guard.lock();
        for path in [&self.path, &self.legacy_path] {
            if self.fs.exists(path) {
                self.fs
                    .remove_file(path)
                    .map_err(|e| PluginError::io(path, e))?;
            }
        }

        debug!("Marked all plugins as uninstalled");
        Ok(())
    }

    fn read_names(&self) -> Result<Vec<String>> {
        if !self.fs.exists(&self.path) {
            if self.fs.exists(&self.legacy_path) {
                return self.migrate_legacy();
            }
            return Ok(Vec::new());
        }

        let text = self
            .fs
            .read_to_string(&self.path)
            .map_err(|e| PluginError::io(&self.path, e))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&text).map_err(|source| PluginError::InstalledRecord {
            path: self.path.clone(),
            source,
        })
    }

    fn migrate_legacy(&self) -> Result<Vec<String>> {
        let text = self
            .fs
            .read_to_string(&self.legacy_path)
            .map_err(|e| PluginError::io(&self.legacy_path, e))?;

        let mut names: Vec<String> = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !names.iter().any(|n| n.eq_ignore_ascii_case(line)) {
                names.push(line.to_string());
            }
        }

        self.write_names(&names)?;
        self.fs
            .remove_file(&self.legacy_path)
            .map_err(|e| PluginError::io(&self.legacy_path, e))?;

        info!(
            "Migrated {} installed plugin name(s) from {}",
            names.len(),
            self.legacy_path.display()
        );
        Ok(names)
    }

    fn write_names(&self, names: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                self.fs
                    .create_dir_all(parent)
                    .map_err(|e| PluginError::io(parent, e))?;
            }
        }

        let json =
            serde_json::to_string_pretty(names).map_err(|source| PluginError::InstalledRecord {
                path: self.path.clone(),
                source,
            })?;
        self.fs
            .write(&self.path, json.as_bytes())
            .map_err(|e| PluginError::io(&self.path, e))
    }
}
