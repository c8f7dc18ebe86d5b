//! File ownership fix-up for the no-VM driver.
//!
//! With `--vm-driver=none` the start runs under sudo, so everything written
//! to the home directory is owned by root. This hands the tree back to the
//! invoking user.

use std::fs;
use std::os::unix::fs::lchown;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::unistd::User;
use tracing::{debug, info};

/// Opt-in for the fix-up.
pub const CHANGE_NONE_USER_ENV: &str = "CHANGE_LOKUBE_NONE_USER";

/// Set by sudo to the invoking user.
pub const SUDO_USER_ENV: &str = "SUDO_USER";

/// Recursively change ownership of `root` to `username`.
///
/// Symlinks are re-owned, not followed.
pub fn chown_recursive(root: &Path, username: &str) -> Result<()> {
    let user = User::from_name(username)
        .with_context(|| format!("failed to look up user {:?}", username))?
        .ok_or_else(|| anyhow!("user {:?} does not exist", username))?;

    let uid = user.uid.as_raw();
    let gid = user.gid.as_raw();
    let count = chown_tree(root, uid, gid)?;

    info!(path = %root.display(), user = %username, entries = count, "Changed ownership");
    Ok(())
}

fn chown_tree(path: &Path, uid: u32, gid: u32) -> Result<usize> {
    lchown(path, Some(uid), Some(gid))
        .with_context(|| format!("failed to chown {:?}", path))?;
    let mut count = 1;

    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path).with_context(|| format!("failed to read {:?}", path))? {
            count += chown_tree(&entry?.path(), uid, gid)?;
        }
    }

    debug!(path = %path.display(), "chown");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_chown_to_current_owner() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("profiles/lokube")).unwrap();
        fs::write(dir.path().join("profiles/lokube/config.json"), "{}").unwrap();

        let me = User::from_uid(nix::unistd::getuid()).unwrap().unwrap();
        chown_recursive(dir.path(), &me.name).unwrap();

        let meta = fs::metadata(dir.path().join("profiles/lokube/config.json")).unwrap();
        assert_eq!(meta.uid(), me.uid.as_raw());
    }

    #[test]
    fn test_unknown_user_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(chown_recursive(dir.path(), "no-such-user-lokube").is_err());
    }
}
