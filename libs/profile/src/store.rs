//! Profile document persistence.
//!
//! Documents are written with write-to-temp + fsync + rename in the target's
//! directory, so readers observe either the old file or the new one, never a
//! truncated one.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::ProfileError;
use crate::model::ProfileDocument;

/// Profile document file name.
pub const PROFILE_FILE: &str = "config.json";

/// Directory under the tool home holding one directory per profile.
pub const PROFILES_DIR: &str = "profiles";

/// Indentation of the serialized document.
const INDENT: &[u8] = b"    ";

/// Load/save access to one profile's document.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    path: PathBuf,
}

impl ProfileStore {
    /// Store backed by an explicit file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store for `<home>/profiles/<profile>/config.json`.
    pub fn for_profile(home: &Path, profile: &str) -> Self {
        Self::new(home.join(PROFILES_DIR).join(profile).join(PROFILE_FILE))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document.
    ///
    /// A missing file is a normal outcome and yields `Ok(None)`.
    pub fn load(&self) -> Result<Option<ProfileDocument>, ProfileError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No saved profile");
                return Ok(None);
            }
            Err(e) => return Err(ProfileError::io(&self.path, e)),
        };

        let doc = serde_json::from_str(&contents).map_err(|source| ProfileError::Parse {
            path: self.path.clone(),
            source,
        })?;

        Ok(Some(doc))
    }

    /// Replace the document atomically.
    pub fn save(&self, doc: &ProfileDocument) -> Result<(), ProfileError> {
        let data = to_json(doc)?;
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        create_private_dir(dir)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".config.json.")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| ProfileError::io(dir, e))?;

        tmp.write_all(&data)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| ProfileError::io(tmp.path(), e))?;

        // NamedTempFile is created 0600 on unix; nothing else to tighten.
        tmp.persist(&self.path)
            .map_err(|source| ProfileError::Persist {
                path: self.path.clone(),
                source,
            })?;

        debug!(path = %self.path.display(), bytes = data.len(), "Saved profile");
        Ok(())
    }
}

/// Serialize with stable field order and four-space indentation.
pub fn to_json(doc: &ProfileDocument) -> Result<Vec<u8>, ProfileError> {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(INDENT);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    doc.serialize(&mut ser)?;
    Ok(buf)
}

fn create_private_dir(dir: &Path) -> Result<(), ProfileError> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }

    builder.create(dir).map_err(|e| ProfileError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExtraOption, KubernetesConfig, MachineConfig};

    fn sample() -> ProfileDocument {
        let machine = MachineConfig {
            iso_url: "https://example.com/lokube.iso".to_string(),
            memory_mb: 2048,
            cpus: 2,
            disk_size_mb: 20_000,
            vm_driver: "virtualbox".to_string(),
            docker_env: vec!["HTTP_PROXY=http://proxy:3128".to_string()],
            ..Default::default()
        };
        let cluster = KubernetesConfig {
            kubernetes_version: "v1.10.0".to_string(),
            node_ip: "192.168.99.100".to_string(),
            node_port: 8443,
            api_server_ips: vec!["10.0.0.1".parse().unwrap()],
            extra_options: vec![
                ExtraOption::new("kubelet", "max-pods", "50"),
                ExtraOption::new("apiserver", "audit-log-path", "-"),
                ExtraOption::new("etcd", "quota-backend-bytes", "0"),
            ],
            ..Default::default()
        };
        ProfileDocument::complete(machine, cluster)
    }

    fn temp_store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::for_profile(dir.path(), "lokube");
        (dir, store)
    }

    #[test]
    fn test_load_missing_is_none() {
        let (_dir, store) = temp_store();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let (_dir, store) = temp_store();
        let doc = sample();

        store.save(&doc).unwrap();
        let loaded = store.load().unwrap().unwrap();

        assert_eq!(loaded, doc);
        let opts = &loaded.kubernetes_config.unwrap().extra_options;
        assert_eq!(opts[0].component, "kubelet");
        assert_eq!(opts[2].component, "etcd");
    }

    #[test]
    fn test_repeated_saves_are_byte_stable() {
        let (_dir, store) = temp_store();
        let doc = sample();

        store.save(&doc).unwrap();
        let first = fs::read(store.path()).unwrap();
        store.save(&doc).unwrap();
        let second = fs::read(store.path()).unwrap();

        assert_eq!(first, second);
        let text = String::from_utf8(first).unwrap();
        assert!(text.contains("\n    \"machine_config\": {"));
        assert!(text.find("machine_config").unwrap() < text.find("kubernetes_config").unwrap());
    }

    #[test]
    fn test_overwrite_leaves_no_temp_files() {
        let (_dir, store) = temp_store();
        store
            .save(&ProfileDocument::machine_only(sample().machine_config))
            .unwrap();
        store.save(&sample()).unwrap();

        let entries: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(PROFILE_FILE)]);
        assert!(store.load().unwrap().unwrap().kubernetes_config.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, store) = temp_store();
        store.save(&sample()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_is_parse_error() {
        let (_dir, store) = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), b"{\"machine_config\": ").unwrap();

        assert!(matches!(store.load(), Err(ProfileError::Parse { .. })));
    }
}
