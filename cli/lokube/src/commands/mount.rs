//! Mount command (the helper launched by `lokube start --mount`).

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::mount::{MountString, CHILD_PROCESS_ENV};
use crate::paths::LokubeHome;

/// Mount command - bind a host directory into the cluster host until stopped.
#[derive(Debug, Args)]
pub struct MountCommand {
    /// Directory to mount, as <host path>:<guest path>.
    mount_string: String,
}

impl MountCommand {
    pub async fn run(self) -> Result<()> {
        let mount: MountString = self.mount_string.parse()?;
        let supervised = std::env::var(CHILD_PROCESS_ENV).is_ok_and(|v| v == "true");

        info!(mount = %mount, supervised = supervised, "Starting mount helper");
        println!("Mounting {} into {}...", mount.source.display(), mount.target.display());

        bind_mount(&mount.source, &mount.target)?;
        println!("Successfully mounted {}", mount);

        wait_for_shutdown().await?;

        info!(path = %mount.target.display(), "Unmounting");
        let result = unmount(&mount.target);

        if supervised {
            remove_pid_file();
        }
        result
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

fn remove_pid_file() {
    let pid_file = match LokubeHome::from_env() {
        Ok(home) => home.mount_pid_file(),
        Err(e) => {
            warn!(error = %e, "Could not locate mount pid file");
            return;
        }
    };

    if let Err(e) = std::fs::remove_file(&pid_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %pid_file.display(), error = %e, "Failed to remove mount pid file");
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_mount(source: &Path, target: &Path) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    std::fs::create_dir_all(target).with_context(|| format!("failed to create {:?}", target))?;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind mount {:?} on {:?}", source, target))?;
    Ok(())
}

#[cfg(target_os = "linux")]
fn unmount(target: &Path) -> Result<()> {
    use nix::mount::{umount2, MntFlags};

    umount2(target, MntFlags::MNT_DETACH)
        .with_context(|| format!("failed to unmount {:?}", target))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_mount(_source: &Path, _target: &Path) -> Result<()> {
    anyhow::bail!("host mounts are only supported on Linux")
}

#[cfg(not(target_os = "linux"))]
fn unmount(_target: &Path) -> Result<()> {
    Ok(())
}
