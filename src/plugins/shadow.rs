//! Shadow-copy deployment
//!
//! Plugin artifacts are copied into `plugins/bin` and loaded from there so
//! the originals in the plugin folders stay unlocked and can be replaced
//! while the host runs. When the copy in `bin` is itself held open by an
//! earlier host process, the artifact is deployed into a fresh
//! `bin/reserve_bin_<filetime>` folder instead.

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::ShadowCopyConfig;

use super::error::{PluginError, Result};
use super::fs::{file_name_of, is_lock_error, Clock, FileSystem};
use super::loader::{LoadError, ModuleHandle, ModuleLoader};
use super::resolver::Candidate;

/// Prefix of reserve shadow-copy folders
pub const RESERVE_FOLDER_PREFIX: &str = "reserve_bin_";

const PARTIAL_SUFFIX: &str = ".partial";

/// Seconds between 1601-01-01 and the Unix epoch
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// Where a plugin ended up and the module loaded from it
#[derive(Debug, Clone)]
pub struct Deployment {
    pub deployed_path: PathBuf,
    pub module: ModuleHandle,
}

/// Copies plugin artifacts into the shadow directory and loads them
pub struct ShadowCopyDeployer {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    shadow_dir: PathBuf,
    policy: ShadowCopyConfig,
}

impl ShadowCopyDeployer {
    #[must_use]
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        shadow_dir: PathBuf,
        policy: ShadowCopyConfig,
    ) -> Self {
        Self {
            fs,
            clock,
            shadow_dir,
            policy,
        }
    }

    /// Create the shadow directory and clean it up for a new load pass
    ///
    /// Interrupted copies are always removed. With `clear_on_startup` every
    /// file and reserve folder goes too; failures there are logged and
    /// skipped since a file may still be held by another process.
    pub fn prepare(&self) -> Result<()> {
        self.fs
            .create_dir_all(&self.shadow_dir)
            .map_err(|e| PluginError::io(&self.shadow_dir, e))?;

        let entries = self
            .fs
            .read_dir(&self.shadow_dir)
            .map_err(|e| PluginError::io(&self.shadow_dir, e))?;

        for entry in entries {
            let name = file_name_of(&entry);
            if self.fs.is_dir(&entry) {
                if self.policy.clear_on_startup && name.starts_with(RESERVE_FOLDER_PREFIX) {
                    self.remove_dir_logged(&entry);
                }
            } else if name.ends_with(PARTIAL_SUFFIX) || self.policy.clear_on_startup {
                if let Err(e) = self.fs.remove_file(&entry) {
                    warn!("Failed to delete shadow copy {}: {}", entry.display(), e);
                }
            }
        }

        Ok(())
    }

    /// Remove every reserve folder, returning how many were deleted
    pub fn purge_reserve_directories(&self) -> Result<usize> {
        if !self.fs.exists(&self.shadow_dir) {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in self
            .fs
            .read_dir(&self.shadow_dir)
            .map_err(|e| PluginError::io(&self.shadow_dir, e))?
        {
            if self.fs.is_dir(&entry)
                && file_name_of(&entry).starts_with(RESERVE_FOLDER_PREFIX)
                && self.remove_dir_logged(&entry)
            {
                removed += 1;
            }
        }

        debug!("Purged {} reserve folder(s)", removed);
        Ok(removed)
    }

    /// Copy `source` into `target_dir` unless an up-to-date copy is already there
    ///
    /// Returns the path of the deployed artifact.
    pub fn deploy(&self, source: &Path, target_dir: &Path) -> Result<PathBuf> {
        let target = target_dir.join(file_name_of(source));

        if self.fs.exists(&target) {
            let source_time = self
                .fs
                .modified(source)
                .map_err(|e| PluginError::io(source, e))?;
            let target_time = self
                .fs
                .modified(&target)
                .map_err(|e| PluginError::io(&target, e))?;

            if target_time >= source_time {
                debug!(
                    "Not copying {}; shadow copy is up to date",
                    file_name_of(source)
                );
                return Ok(target);
            }

            debug!(
                "New version of {} found; deleting the old shadow copy",
                file_name_of(source)
            );
            if let Err(e) = self.fs.remove_file(&target) {
                if !blocked_by_lock(&e) {
                    return Err(PluginError::io(&target, e));
                }
                debug!("{} is locked; it will be moved aside", target.display());
            }
        }

        self.copy_into_place(source, &target)?;
        Ok(target)
    }

    /// Deploy a resolved plugin and load it
    ///
    /// A locked primary copy falls back to a reserve folder once when the
    /// policy allows it; any other load failure is fatal.
    pub fn deploy_and_load(
        &self,
        candidate: &Candidate,
        loader: &dyn ModuleLoader,
    ) -> Result<Deployment> {
        if !self.policy.enabled {
            let module = loader
                .load(&candidate.artifact)
                .map_err(|e| module_load_error(candidate, e))?;
            return Ok(Deployment {
                deployed_path: candidate.artifact.clone(),
                module: ModuleHandle::new(module),
            });
        }

        // Artifacts must sit in a plugin folder directly under the plugin root
        let plugin_root = self.shadow_dir.parent();
        let in_hierarchy = plugin_root.is_some()
            && candidate.artifact.parent().and_then(Path::parent) == plugin_root;
        if !in_hierarchy {
            return Err(PluginError::OutsideHierarchy {
                path: candidate.artifact.clone(),
            });
        }

        match self.deploy_into(candidate, &self.shadow_dir, loader)? {
            Ok(deployment) => Ok(deployment),
            Err(load_error) if load_error.is_locked() && self.policy.copy_locked_to_reserve => {
                let reserve = self.create_reserve_dir()?;
                warn!(
                    "Shadow copy of {} is locked; deploying into {}",
                    candidate.descriptor.system_name,
                    reserve.display()
                );
                self.deploy_into(candidate, &reserve, loader)?
                    .map_err(|e| module_load_error(candidate, e))
            }
            Err(load_error) => Err(module_load_error(candidate, load_error)),
        }
    }

    fn deploy_into(
        &self,
        candidate: &Candidate,
        dir: &Path,
        loader: &dyn ModuleLoader,
    ) -> Result<std::result::Result<Deployment, LoadError>> {
        for companion in &candidate.companions {
            self.deploy(companion, dir)?;
        }
        let deployed_path = self.deploy(&candidate.artifact, dir)?;

        Ok(loader.load(&deployed_path).map(|module| Deployment {
            deployed_path,
            module: ModuleHandle::new(module),
        }))
    }

    fn create_reserve_dir(&self) -> Result<PathBuf> {
        let name = format!("{RESERVE_FOLDER_PREFIX}{}", file_time(self.clock.now()));
        let dir = self.shadow_dir.join(name);
        self.fs
            .create_dir_all(&dir)
            .map_err(|e| PluginError::io(&dir, e))?;
        Ok(dir)
    }

    /// Copy to a scratch file next to `target`, stamp it, then move it into place
    fn copy_into_place(&self, source: &Path, target: &Path) -> Result<()> {
        let partial = target.with_file_name(format!(
            "{}.{}{}",
            file_name_of(target),
            Uuid::new_v4().simple(),
            PARTIAL_SUFFIX
        ));

        let copy_failed = |source_err: io::Error| PluginError::CopyFailed {
            from: source.to_path_buf(),
            to: target.to_path_buf(),
            source: source_err,
        };

        let staged = self
            .fs
            .copy(source, &partial)
            .and_then(|_| self.fs.modified(source))
            .and_then(|time| self.fs.set_modified(&partial, time));
        if let Err(e) = staged {
            self.discard(&partial);
            return Err(copy_failed(e));
        }

        match self.fs.rename(&partial, target) {
            Ok(()) => Ok(()),
            Err(e) if blocked_by_lock(&e) => {
                debug!("{} is locked, attempting to rename it", target.display());
                if let Err(rename_err) = self.move_aside(target) {
                    self.discard(&partial);
                    return Err(rename_err);
                }
                self.fs.rename(&partial, target).map_err(|e| {
                    self.discard(&partial);
                    copy_failed(e)
                })
            }
            Err(e) => {
                self.discard(&partial);
                Err(copy_failed(e))
            }
        }
    }

    fn move_aside(&self, target: &Path) -> Result<()> {
        let old = target.with_file_name(format!(
            "{}{}.old",
            file_name_of(target),
            Uuid::new_v4().simple()
        ));
        self.fs
            .rename(target, &old)
            .map_err(|source| PluginError::LockedArtifact {
                path: target.to_path_buf(),
                source,
            })
    }

    fn discard(&self, partial: &Path) {
        if self.fs.exists(partial) {
            if let Err(e) = self.fs.remove_file(partial) {
                warn!("Failed to remove {}: {}", partial.display(), e);
            }
        }
    }

    fn remove_dir_logged(&self, dir: &Path) -> bool {
        match self.fs.remove_dir_all(dir) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to delete reserve folder {}: {}", dir.display(), e);
                false
            }
        }
    }
}

/// Windows reports a replace of an in-use file as access denied
fn blocked_by_lock(err: &io::Error) -> bool {
    is_lock_error(err) || (cfg!(windows) && err.kind() == io::ErrorKind::PermissionDenied)
}

fn module_load_error(candidate: &Candidate, source: LoadError) -> PluginError {
    let descriptor = &candidate.descriptor;
    let friendly_name = if descriptor.friendly_name.is_empty() {
        descriptor.system_name.clone()
    } else {
        descriptor.friendly_name.clone()
    };
    error!("Failed to load plugin {}: {}", friendly_name, source.chain());
    PluginError::ModuleLoad {
        friendly_name,
        source,
    }
}

/// 100-nanosecond intervals since 1601-01-01 UTC
pub(crate) fn file_time(now: DateTime<Utc>) -> i64 {
    (now.timestamp() + FILETIME_EPOCH_OFFSET_SECS) * 10_000_000
        + i64::from(now.timestamp_subsec_nanos() / 100)
}
