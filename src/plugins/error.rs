use std::io;
use std::path::PathBuf;

use super::loader::LoadError;

/// Errors raised while discovering, resolving, deploying or managing plugins
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Malformed plugin descriptor {}: {source}", path.display())]
    MalformedDescriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "Plugin descriptor {} has no system name. Assign the plugin a unique system name",
        path.display()
    )]
    MissingSystemName { path: PathBuf },

    #[error("A plugin with system name '{name}' is already defined ({})", path.display())]
    DuplicateSystemName { name: String, path: PathBuf },

    #[error(
        "Plugin artifact {} is outside of the allowed plugin folder hierarchy",
        path.display()
    )]
    OutsideHierarchy { path: PathBuf },

    #[error("Failed to copy {} to {}: {source}", from.display(), to.display())]
    CopyFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is locked and could not be renamed, cannot deploy plugin: {source}", path.display())]
    LockedArtifact {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to load plugin '{friendly_name}': {source}")]
    ModuleLoad {
        friendly_name: String,
        #[source]
        source: LoadError,
    },

    #[error("Invalid installed plugins record {}: {source}", path.display())]
    InstalledRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Plugin initialization was cancelled")]
    Cancelled,

    #[error("Plugin initialization failed earlier; restart the process to retry")]
    InitializationFailed,
}

impl PluginError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error aborts initialization as a descriptor problem
    #[must_use]
    pub fn is_descriptor_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedDescriptor { .. }
                | Self::MissingSystemName { .. }
                | Self::DuplicateSystemName { .. }
        )
    }
}

pub type Result<T, E = PluginError> = std::result::Result<T, E>;
