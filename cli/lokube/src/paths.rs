//! Filesystem locations under the lokube home directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use directories::BaseDirs;
use lokube_profile::{ProfileStore, PROFILES_DIR};

use crate::options::DEFAULT_MOUNT_TARGET;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "LOKUBE_HOME";

/// Home directory name under the user's home.
const HOME_DIR_NAME: &str = ".lokube";

/// Liveness record of the mount helper.
pub const MOUNT_PROCESS_FILE: &str = ".mount-process";

/// Marker written once a profile's machine has been started.
const MACHINE_MARKER: &str = "machine";

fn user_home() -> Result<PathBuf> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Root of all persisted lokube state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LokubeHome {
    root: PathBuf,
}

impl LokubeHome {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$LOKUBE_HOME`, else `~/.lokube`.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(HOME_ENV) {
            Some(root) if !root.is_empty() => Ok(Self::new(root)),
            _ => Ok(Self::new(user_home()?.join(HOME_DIR_NAME))),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn profile_dir(&self, profile: &str) -> PathBuf {
        self.root.join(PROFILES_DIR).join(profile)
    }

    pub fn profile_store(&self, profile: &str) -> ProfileStore {
        ProfileStore::for_profile(&self.root, profile)
    }

    pub fn machine_marker(&self, machine: &str) -> PathBuf {
        self.profile_dir(machine).join(MACHINE_MARKER)
    }

    pub fn mount_pid_file(&self) -> PathBuf {
        self.root.join(MOUNT_PROCESS_FILE)
    }

    /// Client credential or CA file generated by the bootstrapper.
    pub fn cert(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn image_cache_dir(&self) -> PathBuf {
        self.root.join("cache").join("images")
    }
}

/// `<user home>:/lokube-host`.
pub fn default_mount_string() -> Result<String> {
    Ok(format!("{}:{}", user_home()?.display(), DEFAULT_MOUNT_TARGET))
}

/// First entry of `$KUBECONFIG`, else `~/.kube/config`.
pub fn default_kubeconfig_path() -> Result<PathBuf> {
    if let Some(value) = std::env::var_os("KUBECONFIG") {
        if let Some(first) = std::env::split_paths(&value).find(|p| !p.as_os_str().is_empty()) {
            return Ok(first);
        }
    }
    Ok(user_home()?.join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let home = LokubeHome::new("/data/lokube");

        assert_eq!(
            home.profile_store("dev").path(),
            Path::new("/data/lokube/profiles/dev/config.json")
        );
        assert_eq!(home.mount_pid_file(), Path::new("/data/lokube/.mount-process"));
        assert_eq!(home.cert("ca.crt"), Path::new("/data/lokube/ca.crt"));
        assert_eq!(
            home.machine_marker("dev"),
            Path::new("/data/lokube/profiles/dev/machine")
        );
    }
}
