//! Start failures and their display.

use std::net::AddrParseError;

use colored::Colorize;
use lokube_profile::ConfigError;
use lokube_retry::RetryError;
use thiserror::Error;

use crate::mount::MountError;

/// A fatal step of the start sequence failed.
///
/// One variant per fatal step; advisory failures are logged and never
/// surface here.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("Error getting provisioning client for driver {driver:?}")]
    Provisioner {
        driver: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error checking if machine {machine:?} exists")]
    MachineExists {
        machine: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error starting host")]
    HostStart(#[source] RetryError<anyhow::Error>),

    #[error("Error getting VM IP address")]
    HostIp(#[source] anyhow::Error),

    #[error("VM IP address {ip:?} is not an IP address")]
    InvalidNodeIp {
        ip: String,
        #[source]
        source: AddrParseError,
    },

    #[error("Error getting cluster bootstrapper {name:?}")]
    Bootstrapper {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error updating cluster")]
    UpdateCluster(#[source] anyhow::Error),

    #[error("Error configuring authentication")]
    SetupCerts(#[source] anyhow::Error),

    #[error("Error connecting to cluster")]
    HostUrl(#[source] anyhow::Error),

    #[error("Error setting up kubeconfig")]
    Kubeconfig(#[source] anyhow::Error),

    #[error("Error starting cluster")]
    StartCluster(#[source] anyhow::Error),

    #[error("Error restarting cluster")]
    RestartCluster(#[source] anyhow::Error),

    #[error("Error starting cluster: kubelet not healthy")]
    KubeletHealth(#[source] RetryError<anyhow::Error>),

    #[error("Error starting cluster: apiserver not healthy")]
    ApiServerHealth(#[source] RetryError<anyhow::Error>),

    #[error("Error starting mount")]
    Mount(#[from] MountError),

    #[error("Error recursively changing ownership of {path:?}")]
    Ownership {
        path: String,
        #[source]
        source: anyhow::Error,
    },
}

impl StartError {
    /// Suggested next step for the user, if there is an obvious one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::InvalidConfig(ConfigError::DiskTooSmall { .. }) => {
                Some("Pass a larger --disk-size, for example --disk-size=20g.")
            }
            Self::InvalidConfig(ConfigError::GpuUnsupportedDriver { .. }) => {
                Some("GPU passthrough requires --vm-driver=kvm2.")
            }
            Self::Provisioner { .. } => {
                Some("This build provisions hosts only with --vm-driver=none.")
            }
            Self::HostStart(_) => {
                Some("Check that the hypervisor for --vm-driver is installed and running.")
            }
            Self::KubeletHealth(_) | Self::ApiServerHealth(_) => {
                Some("Check the kubelet logs on the host with `journalctl -u kubelet`.")
            }
            Self::Ownership { .. } => Some(
                "Run `sudo chown -R $USER` on the lokube home directory to fix permissions.",
            ),
            _ => None,
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    for cause in err.chain().skip(1) {
        eprintln!("  {} {}", "caused by:".dimmed(), cause);
    }

    if let Some(hint) = err.downcast_ref::<StartError>().and_then(StartError::hint) {
        eprintln!("\n{}", format!("Hint: {}", hint).yellow());
    }
}
