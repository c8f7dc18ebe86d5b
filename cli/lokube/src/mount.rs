//! Mount helper spawn.
//!
//! The helper is this same executable run as `lokube mount`, detached into
//! its own process group. It is never joined: its PID is written to a well
//! known file so `lokube` (or an operator) can find and stop it later.

use std::fmt;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;

use thiserror::Error;
use tracing::{info, warn};

/// Marker telling the helper it was launched by a start run.
pub const CHILD_PROCESS_ENV: &str = "LOKUBE_CHILD_PROCESS";

/// Verbosity at which the helper's output is shown.
pub const CHILD_OUTPUT_VERBOSITY: u8 = 8;

#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid mount string {input:?}: {reason}")]
    InvalidMountString { input: String, reason: &'static str },

    #[error("failed to launch mount helper {program:?}")]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to record mount helper pid in {path:?}")]
    RecordPid {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// `<host path>:<guest path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountString {
    pub source: PathBuf,
    pub target: PathBuf,
}

impl FromStr for MountString {
    type Err = MountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| MountError::InvalidMountString {
            input: s.to_string(),
            reason,
        };

        let (source, target) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected <source>:<target>"))?;
        if source.is_empty() {
            return Err(invalid("source path is empty"));
        }
        if !target.starts_with('/') {
            return Err(invalid("target must be an absolute path"));
        }

        Ok(Self {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
        })
    }
}

impl fmt::Display for MountString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source.display(), self.target.display())
    }
}

/// Launches the mount helper and records its PID.
#[derive(Debug, Clone)]
pub struct MountSpawner {
    program: PathBuf,
    pid_file: PathBuf,
    verbosity: u8,
}

impl MountSpawner {
    pub fn new(program: impl Into<PathBuf>, pid_file: impl Into<PathBuf>, verbosity: u8) -> Self {
        Self {
            program: program.into(),
            pid_file: pid_file.into(),
            verbosity,
        }
    }

    /// Spawner re-invoking the running executable.
    pub fn current_exe(pid_file: impl Into<PathBuf>, verbosity: u8) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, pid_file, verbosity))
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    fn child_verbosity(&self) -> u8 {
        if self.verbosity >= CHILD_OUTPUT_VERBOSITY {
            1
        } else {
            0
        }
    }

    fn output(&self) -> Stdio {
        if self.verbosity >= CHILD_OUTPUT_VERBOSITY {
            Stdio::inherit()
        } else {
            Stdio::null()
        }
    }

    /// Launch `<program> mount --v=<n> <mount string>` and return its PID.
    pub fn spawn(&self, mount: &str) -> Result<u32, MountError> {
        let mut child = Command::new(&self.program)
            .arg("mount")
            .arg(format!("--v={}", self.child_verbosity()))
            .arg(mount)
            .env(CHILD_PROCESS_ENV, "true")
            .stdin(Stdio::null())
            .stdout(self.output())
            .stderr(self.output())
            .process_group(0)
            .spawn()
            .map_err(|source| MountError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id();
        if let Err(e) = self.record_pid(pid) {
            // Nothing would know to stop an unrecorded helper.
            if let Err(kill_err) = child.kill() {
                warn!(pid = pid, error = %kill_err, "Failed to stop unrecorded mount helper");
            }
            let _ = child.wait();
            return Err(e);
        }

        info!(
            pid = pid,
            mount = %mount,
            pid_file = %self.pid_file.display(),
            "Mount helper started"
        );
        Ok(pid)
    }

    /// Write the PID through a 0600 temp file renamed over the record.
    fn record_pid(&self, pid: u32) -> Result<(), MountError> {
        let record = |source| MountError::RecordPid {
            path: self.pid_file.clone(),
            source,
        };

        let dir = self
            .pid_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(record)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".mount-process.")
            .tempfile_in(dir)
            .map_err(record)?;
        tmp.write_all(pid.to_string().as_bytes()).map_err(record)?;
        tmp.persist(&self.pid_file).map_err(|e| record(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_parse_mount_string() {
        let mount: MountString = "/home/dev:/lokube-host".parse().unwrap();
        assert_eq!(mount.source, PathBuf::from("/home/dev"));
        assert_eq!(mount.target, PathBuf::from("/lokube-host"));
        assert_eq!(mount.to_string(), "/home/dev:/lokube-host");
    }

    #[rstest]
    #[case("/home/dev")]
    #[case(":/lokube-host")]
    #[case("/home/dev:relative")]
    fn test_invalid_mount_string(#[case] input: &str) {
        assert!(matches!(
            input.parse::<MountString>(),
            Err(MountError::InvalidMountString { .. })
        ));
    }

    #[test]
    fn test_spawn_records_pid() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join(".mount-process");
        let spawner = MountSpawner::new("/bin/true", &pid_file, 0);

        let pid = spawner.spawn("/src:/dst").unwrap();

        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), pid.to_string());
        let mode = std::fs::metadata(&pid_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join(".mount-process");
        let spawner = MountSpawner::new(dir.path().join("missing-binary"), &pid_file, 0);

        assert!(matches!(
            spawner.spawn("/src:/dst"),
            Err(MountError::Launch { .. })
        ));
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_child_verbosity() {
        assert_eq!(MountSpawner::new("lokube", "pid", 7).child_verbosity(), 0);
        assert_eq!(MountSpawner::new("lokube", "pid", 8).child_verbosity(), 1);
    }

    fn running_with_arg(arg: &str) -> bool {
        std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|entry| std::fs::read(entry.ok()?.path().join("cmdline")).ok())
            .any(|cmdline| cmdline.split(|b| *b == 0).any(|part| part == arg.as_bytes()))
    }

    #[test]
    fn test_record_failure_stops_helper() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();

        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\nsleep 30\n").unwrap();
        std::fs::set_permissions(&helper, std::fs::Permissions::from_mode(0o755)).unwrap();
        let spawner = MountSpawner::new(&helper, blocker.join(".mount-process"), 0);

        let err = spawner.spawn("/src:/dst").unwrap_err();

        assert!(matches!(err, MountError::RecordPid { .. }));
        assert!(!running_with_arg(&helper.to_string_lossy()));
    }

    #[test]
    fn test_record_tightens_existing_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join(".mount-process");
        std::fs::write(&pid_file, "1").unwrap();
        std::fs::set_permissions(&pid_file, std::fs::Permissions::from_mode(0o644)).unwrap();
        let spawner = MountSpawner::new("/bin/true", &pid_file, 0);

        let pid = spawner.spawn("/src:/dst").unwrap();

        assert_eq!(std::fs::read_to_string(&pid_file).unwrap(), pid.to_string());
        let mode = std::fs::metadata(&pid_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
