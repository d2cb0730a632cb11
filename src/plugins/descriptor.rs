//! Plugin descriptors and their discovery on disk
//!
//! Every plugin lives in its own folder directly under the plugin root and
//! describes itself with a `plugin.json` file:
//!
//! ```text
//! plugins/
//! ├── bin/                  <- shadow-copy target, never scanned
//! ├── payments.paypal/
//! │   ├── plugin.json       <- Found
//! │   └── libpayments_paypal.so
//! └── widgets.banner/
//!     ├── plugin.json       <- Found
//!     └── libwidgets_banner.so
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{PluginError, Result};
use super::fs::{file_name_of, FileSystem};
use super::loader::ModuleHandle;
use super::SHADOW_COPY_FOLDER_NAME;

/// Name of the descriptor file inside each plugin folder
pub const DESCRIPTOR_FILE_NAME: &str = "plugin.json";

/// Platform version assumed for descriptors that declare none
pub const LEGACY_PLATFORM_VERSION: &str = "2.00";

/// Identity and metadata for one plugin
///
/// Only the descriptor file fields are serialized. Installation state,
/// artifact paths and the loaded module are filled in by the registry on
/// every load pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    #[serde(default)]
    pub system_name: String,

    #[serde(default)]
    pub friendly_name: String,

    #[serde(default)]
    pub group: String,

    #[serde(default)]
    pub version: String,

    /// Host versions this plugin runs on
    #[serde(default, alias = "supportedVersions")]
    pub supported_platform_versions: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub display_order: i32,

    /// Binary artifact expected in the plugin folder
    #[serde(default, alias = "fileName")]
    pub assembly_file_name: String,

    #[serde(skip)]
    pub installed: bool,

    #[serde(skip)]
    pub descriptor_path: PathBuf,

    #[serde(skip)]
    pub original_artifact_path: Option<PathBuf>,

    /// Set only once the artifact has been deployed and loaded
    #[serde(skip)]
    pub deployed_artifact_path: Option<PathBuf>,

    #[serde(skip)]
    pub module: Option<ModuleHandle>,
}

impl PluginDescriptor {
    /// Parse a descriptor body, reporting failures against `path`
    pub fn from_json(text: &str, path: &Path) -> Result<Self> {
        let mut descriptor: Self =
            serde_json::from_str(text).map_err(|source| PluginError::MalformedDescriptor {
                path: path.to_path_buf(),
                source,
            })?;

        descriptor.system_name = descriptor.system_name.trim().to_string();
        if descriptor.system_name.is_empty() {
            return Err(PluginError::MissingSystemName {
                path: path.to_path_buf(),
            });
        }

        if descriptor.supported_platform_versions.is_empty() {
            descriptor
                .supported_platform_versions
                .push(LEGACY_PLATFORM_VERSION.to_string());
        }

        descriptor.descriptor_path = path.to_path_buf();
        Ok(descriptor)
    }

    /// Whether the plugin declares support for `host_version`
    #[must_use]
    pub fn supports_version(&self, host_version: &str) -> bool {
        self.supported_platform_versions
            .iter()
            .any(|v| v.trim().eq_ignore_ascii_case(host_version.trim()))
    }

    #[must_use]
    pub fn has_system_name(&self, name: &str) -> bool {
        self.system_name.eq_ignore_ascii_case(name)
    }

    /// Folder holding the descriptor file and the plugin's artifacts
    #[must_use]
    pub fn folder(&self) -> Option<&Path> {
        self.descriptor_path.parent()
    }
}

/// A descriptor found on disk together with the files next to it
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub descriptor_path: PathBuf,
    pub descriptor: PluginDescriptor,
    /// Regular files directly inside the plugin folder
    pub files: Vec<PathBuf>,
}

/// Find and parse the descriptor of every plugin folder directly under `root`
///
/// Results are ordered by display order; plugins with equal display order
/// keep the order in which they were found.
pub fn discover_descriptors(
    fs: &dyn FileSystem,
    root: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveredPlugin>> {
    let mut discovered = Vec::new();

    if !fs.exists(root) {
        debug!("Plugins directory does not exist: {}", root.display());
        return Ok(discovered);
    }

    for folder in fs.read_dir(root).map_err(|e| PluginError::io(root, e))? {
        if cancel.is_cancelled() {
            return Err(PluginError::Cancelled);
        }
        if !fs.is_dir(&folder)
            || file_name_of(&folder).eq_ignore_ascii_case(SHADOW_COPY_FOLDER_NAME)
        {
            continue;
        }

        if let Some(plugin) = read_plugin_folder(fs, &folder)? {
            debug!(
                "Discovered plugin {} at {}",
                plugin.descriptor.system_name,
                folder.display()
            );
            discovered.push(plugin);
        }
    }

    // Stable: equal display orders keep discovery order
    discovered.sort_by_key(|plugin| plugin.descriptor.display_order);

    info!(
        "Found {} plugin descriptor(s) in {}",
        discovered.len(),
        root.display()
    );
    Ok(discovered)
}

/// Parse the descriptor directly inside `folder`; nested folders are not searched
fn read_plugin_folder(fs: &dyn FileSystem, folder: &Path) -> Result<Option<DiscoveredPlugin>> {
    let mut descriptor_path = None;
    let mut files = Vec::new();
    for entry in fs.read_dir(folder).map_err(|e| PluginError::io(folder, e))? {
        if fs.is_dir(&entry) {
            continue;
        }
        if descriptor_path.is_none()
            && file_name_of(&entry).eq_ignore_ascii_case(DESCRIPTOR_FILE_NAME)
        {
            descriptor_path = Some(entry.clone());
        }
        files.push(entry);
    }

    let Some(descriptor_path) = descriptor_path else {
        debug!("No descriptor in {}", folder.display());
        return Ok(None);
    };

    let text = fs
        .read_to_string(&descriptor_path)
        .map_err(|e| PluginError::io(&descriptor_path, e))?;
    let descriptor = PluginDescriptor::from_json(&text, &descriptor_path)?;

    Ok(Some(DiscoveredPlugin {
        descriptor_path,
        descriptor,
        files,
    }))
}

/// Write the descriptor's file fields back to its descriptor file
pub fn save_descriptor(fs: &dyn FileSystem, descriptor: &PluginDescriptor) -> Result<()> {
    let path = &descriptor.descriptor_path;
    let json = serde_json::to_string_pretty(descriptor).map_err(|source| {
        PluginError::MalformedDescriptor {
            path: path.clone(),
            source,
        }
    })?;
    fs.write(path, json.as_bytes())
        .map_err(|e| PluginError::io(path, e))?;

    debug!("Saved descriptor for {}", descriptor.system_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::fs::StdFileSystem;
    use tempfile::{tempdir, TempDir};

    fn write_plugin(root: &Path, folder: &str, body: &str) -> PathBuf {
        let dir = root.join(folder);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(DESCRIPTOR_FILE_NAME);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn descriptor_json(name: &str, order: i32) -> String {
        format!(
            r#"{{
                "systemName": "{name}",
                "friendlyName": "{name} plugin",
                "group": "Widgets",
                "version": "1.0",
                "supportedPlatformVersions": ["4.10"],
                "displayOrder": {order},
                "assemblyFileName": "lib{name}.so"
            }}"#
        )
    }

    fn discover(dir: &TempDir) -> Result<Vec<DiscoveredPlugin>> {
        discover_descriptors(&StdFileSystem, dir.path(), &CancellationToken::new())
    }

    #[test]
    fn test_parse_descriptor() {
        let path = Path::new("plugins/a/plugin.json");
        let descriptor = PluginDescriptor::from_json(&descriptor_json("A", 3), path).unwrap();

        assert_eq!(descriptor.system_name, "A");
        assert_eq!(descriptor.friendly_name, "A plugin");
        assert_eq!(descriptor.display_order, 3);
        assert_eq!(descriptor.assembly_file_name, "libA.so");
        assert_eq!(descriptor.descriptor_path, path);
        assert!(!descriptor.installed);
        assert!(descriptor.module.is_none());
    }

    #[test]
    fn test_missing_versions_default_to_legacy_token() {
        let body = r#"{ "systemName": "Old.Plugin", "fileName": "old.so" }"#;
        let descriptor = PluginDescriptor::from_json(body, Path::new("p.json")).unwrap();

        assert_eq!(
            descriptor.supported_platform_versions,
            vec![LEGACY_PLATFORM_VERSION.to_string()]
        );
        assert_eq!(descriptor.assembly_file_name, "old.so");
    }

    #[test]
    fn test_blank_system_name_is_rejected() {
        let body = r#"{ "systemName": "   ", "friendlyName": "Nameless" }"#;
        let err = PluginDescriptor::from_json(body, Path::new("p.json")).unwrap_err();
        assert!(matches!(err, PluginError::MissingSystemName { .. }));
    }

    #[test]
    fn test_version_match_ignores_case() {
        let mut descriptor = PluginDescriptor::default();
        descriptor.supported_platform_versions = vec!["4.10-RC".to_string()];
        assert!(descriptor.supports_version("4.10-rc"));
        assert!(!descriptor.supports_version("4.10"));
    }

    #[test]
    fn test_discover_sorts_by_display_order_stably() {
        let dir = tempdir().unwrap();
        // Folder names fix the discovery order: B, C, A
        write_plugin(dir.path(), "1-b", &descriptor_json("B", 1));
        write_plugin(dir.path(), "2-c", &descriptor_json("C", 1));
        write_plugin(dir.path(), "3-a", &descriptor_json("A", 5));

        let names: Vec<String> = discover(&dir)
            .unwrap()
            .into_iter()
            .map(|p| p.descriptor.system_name)
            .collect();
        assert_eq!(names, vec!["B", "C", "A"]);
    }

    #[test]
    fn test_discover_records_folder_files() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "a", &descriptor_json("A", 0));
        std::fs::write(dir.path().join("a").join("libA.so"), b"bin").unwrap();
        std::fs::create_dir(dir.path().join("a").join("assets")).unwrap();

        let discovered = discover(&dir).unwrap();
        let files: Vec<String> = discovered[0].files.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(files, vec!["libA.so", "plugin.json"]);
    }

    #[test]
    fn test_discover_ignores_nested_and_shadow_descriptors() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "a", &descriptor_json("A", 0));
        write_plugin(dir.path(), "a/nested", &descriptor_json("Nested", 0));
        write_plugin(dir.path(), SHADOW_COPY_FOLDER_NAME, &descriptor_json("Shadow", 0));
        std::fs::write(dir.path().join(DESCRIPTOR_FILE_NAME), descriptor_json("Root", 0)).unwrap();

        let discovered = discover(&dir).unwrap();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].descriptor.system_name, "A");
    }

    #[test]
    fn test_discover_fails_on_malformed_descriptor() {
        let dir = tempdir().unwrap();
        let bad = write_plugin(dir.path(), "bad", "{ invalid json }");

        match discover(&dir).unwrap_err() {
            PluginError::MalformedDescriptor { path, .. } => assert_eq!(path, bad),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_discover_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let discovered =
            discover_descriptors(&StdFileSystem, &missing, &CancellationToken::new()).unwrap();
        assert!(discovered.is_empty());
    }

    #[test]
    fn test_discover_honours_cancellation() {
        let dir = tempdir().unwrap();
        write_plugin(dir.path(), "a", &descriptor_json("A", 0));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = discover_descriptors(&StdFileSystem, dir.path(), &cancel).unwrap_err();
        assert!(matches!(err, PluginError::Cancelled));
    }

    #[test]
    fn test_save_descriptor_skips_runtime_fields() {
        let dir = tempdir().unwrap();
        let path = write_plugin(dir.path(), "a", &descriptor_json("A", 0));
        let mut descriptor =
            PluginDescriptor::from_json(&std::fs::read_to_string(&path).unwrap(), &path).unwrap();
        descriptor.friendly_name = "Renamed".to_string();
        descriptor.installed = true;

        save_descriptor(&StdFileSystem, &descriptor).unwrap();

        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("\"friendlyName\": \"Renamed\""));
        assert!(!saved.contains("installed"));
        let reparsed = PluginDescriptor::from_json(&saved, &path).unwrap();
        assert_eq!(reparsed.friendly_name, "Renamed");
    }
}
