// Plugin discovery, deployment and registry:
// - Descriptors parsed from plugins/<folder>/plugin.json
// - Installed plugins tracked in a JSON record
// - Artifacts shadow-copied to plugins/bin before loading
// - Loaded plugin set published through a locked registry

pub mod descriptor;
pub mod error;
pub mod fs;
pub mod installed;
pub mod loader;
pub mod registry;
pub mod resolver;
pub mod shadow;

/// Shadow-copy folder directly below the plugin root
pub const SHADOW_COPY_FOLDER_NAME: &str = "bin";

pub use descriptor::{PluginDescriptor, DESCRIPTOR_FILE_NAME};
pub use error::PluginError;
pub use fs::{Clock, FileSystem, StdFileSystem, SystemClock};
pub use installed::InstalledPlugins;
pub use loader::{DylibLoader, LoadError, LoadedModule, ModuleHandle, ModuleLoader, Plugin};
pub use registry::{LoadMode, PluginRegistry, RegistryOptions, RegistryState};
