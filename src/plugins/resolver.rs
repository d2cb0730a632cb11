use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::descriptor::{DiscoveredPlugin, PluginDescriptor};
use super::error::{PluginError, Result};
use super::fs::file_name_of;

/// A compatible plugin whose main artifact was found
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: PluginDescriptor,
    /// Main artifact in the plugin folder
    pub artifact: PathBuf,
    /// Other binaries of the same kind that must sit next to the main artifact
    pub companions: Vec<PathBuf>,
}

/// Outcome of resolving discovered plugins against the host
#[derive(Debug, Default)]
pub struct Resolution {
    pub compatible: Vec<Candidate>,
    /// System names of plugins that cannot run on this host
    pub incompatible: Vec<String>,
}

/// Partition discovered plugins into loadable candidates and incompatible names
///
/// A duplicated system name is a configuration error and fails the whole
/// resolution. An unsupported host version or a missing artifact only demotes
/// that one plugin. Input order is preserved in both partitions.
pub fn resolve(
    discovered: Vec<DiscoveredPlugin>,
    installed: &[String],
    host_version: &str,
) -> Result<Resolution> {
    check_unique_names(&discovered)?;

    let mut resolution = Resolution::default();

    for plugin in discovered {
        let DiscoveredPlugin {
            mut descriptor,
            files,
            ..
        } = plugin;

        descriptor.installed = installed
            .iter()
            .any(|name| descriptor.has_system_name(name));

        if !descriptor.supports_version(host_version) {
            info!(
                "Plugin {} does not support host version {} (supports {:?})",
                descriptor.system_name, host_version, descriptor.supported_platform_versions
            );
            resolution.incompatible.push(descriptor.system_name);
            continue;
        }

        let Some(artifact) = find_artifact(&files, &descriptor.assembly_file_name) else {
            info!(
                "Plugin {} is missing its artifact {:?}",
                descriptor.system_name, descriptor.assembly_file_name
            );
            resolution.incompatible.push(descriptor.system_name);
            continue;
        };

        let companions = companions_of(&files, &artifact);
        descriptor.original_artifact_path = Some(artifact.clone());

        debug!(
            "Plugin {} resolved to {} ({} companion file(s))",
            descriptor.system_name,
            artifact.display(),
            companions.len()
        );
        resolution.compatible.push(Candidate {
            descriptor,
            artifact,
            companions,
        });
    }

    Ok(resolution)
}

fn check_unique_names(discovered: &[DiscoveredPlugin]) -> Result<()> {
    let mut seen: HashMap<String, &Path> = HashMap::with_capacity(discovered.len());
    for plugin in discovered {
        let key = plugin.descriptor.system_name.to_ascii_lowercase();
        if seen.insert(key, &plugin.descriptor_path).is_some() {
            return Err(PluginError::DuplicateSystemName {
                name: plugin.descriptor.system_name.clone(),
                path: plugin.descriptor_path.clone(),
            });
        }
    }
    Ok(())
}

fn find_artifact(files: &[PathBuf], file_name: &str) -> Option<PathBuf> {
    if file_name.trim().is_empty() {
        return None;
    }
    files
        .iter()
        .find(|f| file_name_of(f).eq_ignore_ascii_case(file_name.trim()))
        .cloned()
}

fn companions_of(files: &[PathBuf], artifact: &Path) -> Vec<PathBuf> {
    let Some(extension) = artifact.extension() else {
        return Vec::new();
    };
    let extension = extension.to_string_lossy();

    files
        .iter()
        .filter(|f| f.as_path() != artifact)
        .filter(|f| {
            f.extension()
                .is_some_and(|ext| ext.to_string_lossy().eq_ignore_ascii_case(&extension))
        })
        .cloned()
        .collect()
}
