use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::plugins::installed::{INSTALLED_PLUGINS_FILE_NAME, LEGACY_INSTALLED_PLUGINS_FILE_NAME};

/// Host version used when none is configured
pub const DEFAULT_HOST_VERSION: &str = "1.00";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Plugin root; each plugin lives in its own folder below it
    #[serde(default = "default_plugins_directory")]
    pub directory: PathBuf,

    /// JSON record of installed plugin system names
    #[serde(default = "default_installed_file")]
    pub installed_file: PathBuf,

    /// Line-oriented record written by older hosts, migrated on first read
    #[serde(default = "default_legacy_installed_file")]
    pub legacy_installed_file: PathBuf,

    /// Version token matched against each plugin's supported versions
    #[serde(default = "default_host_version")]
    pub host_version: String,

    #[serde(default)]
    pub shadow_copy: ShadowCopyConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowCopyConfig {
    /// Copy artifacts into `<plugins>/bin` before loading; otherwise load in place
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delete every shadow copy and reserve folder at startup
    #[serde(default)]
    pub clear_on_startup: bool,

    /// Retry a locked load from a fresh `reserve_bin_*` folder
    #[serde(default)]
    pub copy_locked_to_reserve: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_plugins_directory() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_installed_file() -> PathBuf {
    PathBuf::from("data").join(INSTALLED_PLUGINS_FILE_NAME)
}

fn default_legacy_installed_file() -> PathBuf {
    PathBuf::from("data").join(LEGACY_INSTALLED_PLUGINS_FILE_NAME)
}

fn default_host_version() -> String {
    DEFAULT_HOST_VERSION.to_string()
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugins_directory(),
            installed_file: default_installed_file(),
            legacy_installed_file: default_legacy_installed_file(),
            host_version: default_host_version(),
            shadow_copy: ShadowCopyConfig::default(),
        }
    }
}

impl Default for ShadowCopyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            clear_on_startup: false,
            copy_locked_to_reserve: false,
        }
    }
}

impl Config {
    /// Load configuration from default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get default configuration path
    pub fn default_config_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;

        Ok(home.join(".kiln").join("config.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_shadow_copy_config() {
        let config = ShadowCopyConfig::default();
        assert!(config.enabled);
        assert!(!config.clear_on_startup);
        assert!(!config.copy_locked_to_reserve);
    }

    #[test]
    fn test_default_paths() {
        let config = Config::default();
        assert_eq!(config.plugins.directory, PathBuf::from("plugins"));
        assert_eq!(
            config.plugins.installed_file,
            PathBuf::from("data").join(INSTALLED_PLUGINS_FILE_NAME)
        );
        assert_eq!(config.plugins.host_version, DEFAULT_HOST_VERSION);
    }

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
plugins:
  directory: /srv/shop/plugins
  host_version: "4.10"
  shadow_copy:
    clear_on_startup: true
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.plugins.directory, PathBuf::from("/srv/shop/plugins"));
        assert_eq!(config.plugins.host_version, "4.10");
        assert!(config.plugins.shadow_copy.enabled);
        assert!(config.plugins.shadow_copy.clear_on_startup);
        assert_eq!(config.plugins.installed_file, default_installed_file());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");
        let mut config = Config::default();
        config.plugins.host_version = "4.20".to_string();
        config.plugins.shadow_copy.copy_locked_to_reserve = true;

        config.save_to_file(&path).unwrap();
        let loaded = Config::load_from_file(&path).unwrap();

        assert_eq!(loaded.plugins.host_version, "4.20");
        assert_eq!(loaded.plugins.shadow_copy, config.plugins.shadow_copy);
    }
}
