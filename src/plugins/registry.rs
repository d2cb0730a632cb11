//! Plugin registry
//!
//! The registry owns the resolved descriptor set for the whole process. It is
//! built once at startup with its collaborators injected, loads plugins
//! exactly once, and from then on answers queries under a shared lock.
//!
//! ```text
//! Uninitialized ──initialize──▶ Loading ──▶ Ready
//!                                  │
//!                                  └──▶ Failed   (terminal until restart)
//! ```

use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PluginsConfig, ShadowCopyConfig};

use super::descriptor::{discover_descriptors, save_descriptor, PluginDescriptor};
use super::error::{PluginError, Result};
use super::fs::{Clock, FileSystem, StdFileSystem, SystemClock};
use super::installed::InstalledPlugins;
use super::loader::{DylibLoader, ModuleHandle, ModuleLoader};
use super::resolver::resolve;
use super::shadow::ShadowCopyDeployer;
use super::SHADOW_COPY_FOLDER_NAME;

/// Lifecycle of a [`PluginRegistry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Uninitialized,
    Loading,
    Ready,
    Failed,
}

/// Filter on installation state for [`PluginRegistry::descriptors`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadMode {
    #[default]
    All,
    InstalledOnly,
    NotInstalledOnly,
}

impl LoadMode {
    fn accepts(self, descriptor: &PluginDescriptor) -> bool {
        match self {
            Self::All => true,
            Self::InstalledOnly => descriptor.installed,
            Self::NotInstalledOnly => !descriptor.installed,
        }
    }
}

/// Inputs of a load pass
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub root: PathBuf,
    pub host_version: String,
    pub shadow_copy: ShadowCopyConfig,
}

impl RegistryOptions {
    #[must_use]
    pub fn from_config(config: &PluginsConfig) -> Self {
        Self {
            root: config.directory.clone(),
            host_version: config.host_version.clone(),
            shadow_copy: config.shadow_copy.clone(),
        }
    }

    /// Shadow-copy target below the plugin root
    #[must_use]
    pub fn shadow_dir(&self) -> PathBuf {
        self.root.join(SHADOW_COPY_FOLDER_NAME)
    }
}

struct Inner {
    state: RegistryState,
    compatible: Vec<PluginDescriptor>,
    incompatible: Vec<String>,
    deployer: Option<Arc<ShadowCopyDeployer>>,
}

impl Inner {
    fn ready(&self) -> bool {
        self.state == RegistryState::Ready
    }

    fn find(&self, name: &str) -> Option<&PluginDescriptor> {
        if !self.ready() {
            return None;
        }
        self.compatible.iter().find(|d| d.has_system_name(name))
    }
}

struct LoadedSet {
    compatible: Vec<PluginDescriptor>,
    incompatible: Vec<String>,
    deployer: ShadowCopyDeployer,
}

/// Process-wide set of resolved plugins
pub struct PluginRegistry {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    loader: Arc<dyn ModuleLoader>,
    installed: InstalledPlugins,
    inner: RwLock<Inner>,
}

impl PluginRegistry {
    #[must_use]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        loader: Arc<dyn ModuleLoader>,
        installed: InstalledPlugins,
    ) -> Self {
        Self {
            fs,
            clock,
            loader,
            installed,
            inner: RwLock::new(Inner {
                state: RegistryState::Uninitialized,
                compatible: Vec::new(),
                incompatible: Vec::new(),
                deployer: None,
            }),
        }
    }

    /// Registry backed by the real file system, system clock and dynamic libraries
    #[must_use]
    pub fn from_config(config: &PluginsConfig) -> Self {
        let fs: Arc<dyn FileSystem> = Arc::new(StdFileSystem);
        let installed = InstalledPlugins::new(
            Arc::clone(&fs),
            config.installed_file.clone(),
            config.legacy_installed_file.clone(),
        );
        Self::new(fs, Arc::new(SystemClock), Arc::new(DylibLoader), installed)
    }

    #[must_use]
    pub fn state(&self) -> RegistryState {
        self.inner.read().state
    }

    #[must_use]
    pub fn installed_plugins(&self) -> &InstalledPlugins {
        &self.installed
    }

    /// Discover, resolve, deploy and load every plugin under `options.root`
    ///
    /// Runs once per registry. Concurrent callers block until the first
    /// pass finishes and then observe its outcome; a failed pass is final.
    pub fn initialize(&self, options: &RegistryOptions, cancel: &CancellationToken) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            RegistryState::Ready => {
                debug!("Plugin registry already initialized");
                return Ok(());
            }
            RegistryState::Failed | RegistryState::Loading => {
                return Err(PluginError::InitializationFailed);
            }
            RegistryState::Uninitialized => {}
        }

        inner.state = RegistryState::Loading;
        info!("Loading plugins from {}", options.root.display());

        match self.load(options, cancel) {
            Ok(loaded) => {
                info!(
                    "Loaded {} plugin(s), {} incompatible",
                    loaded.compatible.len(),
                    loaded.incompatible.len()
                );
                inner.compatible = loaded.compatible;
                inner.incompatible = loaded.incompatible;
                inner.deployer = Some(Arc::new(loaded.deployer));
                inner.state = RegistryState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("Plugin initialization failed: {}", e);
                inner.state = RegistryState::Failed;
                Err(e)
            }
        }
    }

    /// Run [`initialize`](Self::initialize) on a blocking tokio task
    pub fn initialize_in_background(
        self: &Arc<Self>,
        options: RegistryOptions,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        let registry = Arc::clone(self);
        tokio::task::spawn_blocking(move || registry.initialize(&options, &cancel))
    }

    fn load(&self, options: &RegistryOptions, cancel: &CancellationToken) -> Result<LoadedSet> {
        self.fs
            .create_dir_all(&options.root)
            .map_err(|e| PluginError::io(&options.root, e))?;

        let deployer = ShadowCopyDeployer::new(
            Arc::clone(&self.fs),
            Arc::clone(&self.clock),
            options.shadow_dir(),
            options.shadow_copy.clone(),
        );
        deployer.prepare()?;

        let installed = self.installed.load_names()?;
        let discovered = discover_descriptors(self.fs.as_ref(), &options.root, cancel)?;
        let resolution = resolve(discovered, &installed, &options.host_version)?;

        let mut compatible = Vec::with_capacity(resolution.compatible.len());
        for candidate in resolution.compatible {
            if cancel.is_cancelled() {
                return Err(PluginError::Cancelled);
            }

            let deployment = deployer.deploy_and_load(&candidate, self.loader.as_ref())?;
            let mut descriptor = candidate.descriptor;

            let exported = deployment.module.plugin().system_name();
            if !descriptor.has_system_name(exported) {
                warn!(
                    "Plugin {} exports a plugin named {}",
                    descriptor.system_name, exported
                );
            }

            descriptor.deployed_artifact_path = Some(deployment.deployed_path);
            descriptor.module = Some(deployment.module);
            compatible.push(descriptor);
        }

        Ok(LoadedSet {
            compatible,
            incompatible: resolution.incompatible,
            deployer,
        })
    }

    #[must_use]
    pub fn find_by_system_name(&self, name: &str) -> Option<PluginDescriptor> {
        self.inner.read().find(name).cloned()
    }

    /// Descriptor of the plugin a loaded module belongs to
    #[must_use]
    pub fn find_by_module(&self, module: &ModuleHandle) -> Option<PluginDescriptor> {
        let inner = self.inner.read();
        if !inner.ready() {
            return None;
        }
        inner
            .compatible
            .iter()
            .find(|d| d.module.as_ref() == Some(module))
            .cloned()
    }

    /// Loaded plugins in display order
    #[must_use]
    pub fn all_compatible(&self) -> Vec<PluginDescriptor> {
        let inner = self.inner.read();
        if !inner.ready() {
            return Vec::new();
        }
        inner.compatible.clone()
    }

    /// System names of plugins that cannot run on this host
    #[must_use]
    pub fn all_incompatible(&self) -> Vec<String> {
        let inner = self.inner.read();
        if !inner.ready() {
            return Vec::new();
        }
        inner.incompatible.clone()
    }

    /// Loaded plugins filtered by installation state and, optionally, group
    #[must_use]
    pub fn descriptors(&self, mode: LoadMode, group: Option<&str>) -> Vec<PluginDescriptor> {
        let inner = self.inner.read();
        if !inner.ready() {
            return Vec::new();
        }
        inner
            .compatible
            .iter()
            .filter(|d| mode.accepts(d))
            .filter(|d| group.is_none_or(|g| d.group.eq_ignore_ascii_case(g)))
            .cloned()
            .collect()
    }

    pub fn mark_installed(&self, name: &str) -> Result<()> {
        self.installed.mark_installed(name)?;
        self.set_installed_flag(name, true);
        Ok(())
    }

    pub fn mark_uninstalled(&self, name: &str) -> Result<()> {
        self.installed.mark_uninstalled(name)?;
        self.set_installed_flag(name, false);
        Ok(())
    }

    pub fn mark_all_uninstalled(&self) -> Result<()> {
        self.installed.mark_all_uninstalled()?;
        let mut inner = self.inner.write();
        for descriptor in inner.compatible.iter_mut() {
            descriptor.installed = false;
        }
        Ok(())
    }

    fn set_installed_flag(&self, name: &str, installed: bool) {
        let mut inner = self.inner.write();
        if let Some(descriptor) = inner.compatible.iter_mut().find(|d| d.has_system_name(name)) {
            descriptor.installed = installed;
        }
    }

    /// Remove a plugin's folder from disk
    ///
    /// Returns `false` without touching the disk when the plugin is unknown
    /// or still installed; uninstall it first.
    pub fn delete_artifacts(&self, name: &str) -> bool {
        let folder = {
            let inner = self.inner.read();
            let Some(descriptor) = inner.find(name) else {
                warn!("Cannot delete unknown plugin {}", name);
                return false;
            };
            if descriptor.installed {
                warn!("Refusing to delete installed plugin {}", name);
                return false;
            }
            descriptor.folder().map(Path::to_path_buf)
        };

        let Some(folder) = folder else {
            return false;
        };
        if !self.fs.exists(&folder) {
            return true;
        }

        // The record is re-checked under its own lock; the flag above may be stale
        match self
            .installed
            .unless_installed(name, || self.fs.remove_dir_all(&folder))
        {
            Ok(Some(Ok(()))) => {
                info!("Deleted plugin {} from {}", name, folder.display());
                true
            }
            Ok(Some(Err(e))) => {
                warn!("Failed to delete plugin folder {}: {}", folder.display(), e);
                false
            }
            Ok(None) => {
                warn!("Refusing to delete installed plugin {}", name);
                false
            }
            Err(e) => {
                warn!("Cannot delete plugin {}: {}", name, e);
                false
            }
        }
    }

    /// Persist the in-memory descriptor back to its descriptor file
    ///
    /// Returns `false` when no loaded plugin has that name.
    pub fn save_descriptor(&self, name: &str) -> Result<bool> {
        let Some(descriptor) = self.find_by_system_name(name) else {
            return Ok(false);
        };
        save_descriptor(self.fs.as_ref(), &descriptor)?;
        Ok(true)
    }

    /// Update a loaded descriptor's display fields in memory
    ///
    /// Returns `false` when no loaded plugin has that name.
    pub fn update_descriptor<F>(&self, name: &str, update: F) -> bool
    where
        F: FnOnce(&mut PluginDescriptor),
    {
        let mut inner = self.inner.write();
        if !inner.ready() {
            return false;
        }
        let Some(descriptor) = inner
            .compatible
            .iter_mut()
            .find(|d| d.has_system_name(name))
        else {
            return false;
        };

        let system_name = descriptor.system_name.clone();
        let installed = descriptor.installed;
        update(descriptor);
        // Identity and installation state are owned by the registry
        descriptor.system_name = system_name;
        descriptor.installed = installed;
        true
    }

    /// Delete every `reserve_bin_*` folder left by earlier runs
    pub fn purge_reserve_directories(&self) -> Result<usize> {
        let deployer = self.inner.read().deployer.clone();
        match deployer {
            Some(deployer) => deployer.purge_reserve_directories(),
            None => Ok(0),
        }
    }
}
