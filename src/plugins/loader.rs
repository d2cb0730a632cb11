use libloading::{Library, Symbol};
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::fs::is_lock_error;

/// Symbol every plugin library must export, see [`declare_plugin!`](crate::declare_plugin)
pub const PLUGIN_ENTRY_SYMBOL: &[u8] = b"_kiln_plugin_create";

/// Function signature for the plugin entry point
pub type PluginCreate = unsafe fn() -> *mut dyn Plugin;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Plugin API trait that plugin libraries implement
pub trait Plugin: Send + Sync {
    /// System name the plugin registers under; should match its descriptor
    fn system_name(&self) -> &str;

    fn version(&self) -> &str;

    /// Called once, right after the library is loaded
    fn init(&mut self) -> anyhow::Result<()>;

    /// Called before the library is unloaded
    fn cleanup(&mut self);
}

/// Export the plugin entry point for a type implementing [`Plugin`]
///
/// ```rust,ignore
/// kiln::declare_plugin!(HelloWorldPlugin, HelloWorldPlugin::new);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($plugin_type:ty, $constructor:path) => {
        #[no_mangle]
        pub fn _kiln_plugin_create() -> *mut dyn $crate::plugins::Plugin {
            let plugin: $plugin_type = $constructor();
            let boxed: Box<dyn $crate::plugins::Plugin> = Box::new(plugin);
            Box::into_raw(boxed)
        }
    };
}

/// Why a module could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{} is locked by another process", path.display())]
    Locked {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("{} does not export the plugin entry point", path.display())]
    MissingEntryPoint {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Plugin constructor in {} returned a null pointer", path.display())]
    NullPlugin { path: PathBuf },

    #[error("Plugin in {} failed to initialize", path.display())]
    Init {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Failed to load {}", path.display())]
    Failed {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
}

impl LoadError {
    /// Whether the failure is a file-lock condition that a fresh copy can work around
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }

    /// Build a load error from an arbitrary failure, classifying lock conditions
    pub fn classify(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        let path = path.into();
        let source = source.into();
        if chain_has_lock_error(source.as_ref()) {
            Self::Locked { path, source }
        } else {
            Self::Failed { path, source }
        }
    }

    /// Render the error followed by its whole source chain
    #[must_use]
    pub fn chain(&self) -> String {
        let mut rendered = self.to_string();
        let mut current = self.source();
        while let Some(cause) = current {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            current = cause.source();
        }
        rendered
    }
}

fn chain_has_lock_error(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(cause) = current {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if is_lock_error(io_err) {
                return true;
            }
        }
        current = cause.source();
    }
    false
}

/// A plugin instance together with the library that provides its code
pub struct LoadedModule {
    id: u64,
    path: PathBuf,
    /// Must be declared before `library` so it is dropped first
    plugin: Box<dyn Plugin>,
    library: Option<Library>,
}

impl LoadedModule {
    /// Wrap a plugin that lives in the host binary itself
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, plugin: Box<dyn Plugin>) -> Self {
        Self {
            id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            plugin,
            library: None,
        }
    }

    fn from_library(path: &Path, plugin: Box<dyn Plugin>, library: Library) -> Self {
        let mut module = Self::new(path, plugin);
        module.library = Some(library);
        module
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Path the module was loaded from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        self.library.is_some()
    }
}

impl Drop for LoadedModule {
    fn drop(&mut self) {
        self.plugin.cleanup();
    }
}

impl fmt::Debug for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModule")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("system_name", &self.plugin.system_name())
            .field("dynamic", &self.is_dynamic())
            .finish()
    }
}

/// Shared, identity-compared handle to a [`LoadedModule`]
#[derive(Clone, Debug)]
pub struct ModuleHandle(Arc<LoadedModule>);

impl ModuleHandle {
    #[must_use]
    pub fn new(module: LoadedModule) -> Self {
        Self(Arc::new(module))
    }
}

impl PartialEq for ModuleHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ModuleHandle {}

impl Deref for ModuleHandle {
    type Target = LoadedModule;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Loads a deployed artifact and hands back the plugin it exports
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<LoadedModule, LoadError>;
}

/// [`ModuleLoader`] for native dynamic libraries
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ModuleLoader for DylibLoader {
    fn load(&self, path: &Path) -> Result<LoadedModule, LoadError> {
        // Safety: loading a library runs its initializers; plugin folders are
        // trusted input supplied by the host operator
        let library = unsafe { Library::new(path) }.map_err(|e| LoadError::classify(path, e))?;

        let constructor: PluginCreate = unsafe {
            let symbol: Symbol<PluginCreate> =
                library
                    .get(PLUGIN_ENTRY_SYMBOL)
                    .map_err(|e| LoadError::MissingEntryPoint {
                        path: path.to_path_buf(),
                        source: e.into(),
                    })?;
            *symbol
        };

        // Safety: the entry point contract is a Box<dyn Plugin> leaked with Box::into_raw
        let plugin_ptr = unsafe { constructor() };
        if plugin_ptr.is_null() {
            return Err(LoadError::NullPlugin {
                path: path.to_path_buf(),
            });
        }
        let mut plugin = unsafe { Box::from_raw(plugin_ptr) };

        plugin.init().map_err(|e| LoadError::Init {
            path: path.to_path_buf(),
            source: e.into(),
        })?;

        debug!(
            "Loaded plugin {} v{} from {}",
            plugin.system_name(),
            plugin.version(),
            path.display()
        );

        Ok(LoadedModule::from_library(path, plugin, library))
    }
}
