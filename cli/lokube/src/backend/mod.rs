//! Collaborator interfaces consumed by the start sequence.
//!
//! The sequence never talks to a hypervisor, a remote shell or kubeadm
//! directly. It goes through these traits:
//!
//! - [`HostProvisioner`]: creates or resumes the machine
//! - [`Host`]: address lookup plus a remote command channel
//! - [`Bootstrapper`]: installs and controls control-plane components
//! - [`ImageCache`]: optional image pre-caching
//! - [`Backend`]: factory tying the above to a driver and bootstrapper name
//!
//! ## Implementations
//!
//! - `local`: the no-VM driver (commands run on this machine)
//! - `kubeadm`: command-driven bootstrapper and image cache
//! - `mock`: recording implementation for tests

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use lokube_profile::{KubernetesConfig, MachineConfig};

pub mod kubeadm;
pub mod local;
pub mod mock;

pub use kubeadm::{KubeadmBootstrapper, KubeadmImageCache};
pub use local::{LocalBackend, LocalHost, LocalProvisioner};
pub use mock::MockBackend;

/// Reported state of a cluster component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    Error,
    Unknown,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "Running",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// A provisioned machine.
#[async_trait]
pub trait Host: Send + Sync {
    /// Machine name.
    fn name(&self) -> &str;

    /// Address the control plane is reachable on.
    async fn ip(&self) -> Result<String>;

    /// Engine URL (`tcp://<ip>:2376`).
    async fn url(&self) -> Result<String>;

    /// Run a literal shell command on the machine and return its stdout.
    ///
    /// Nonzero exit and transport failures are both errors.
    async fn run_command(&self, command: &str) -> Result<String>;
}

/// Creates or resumes machines.
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Returns true if the named machine was created before.
    async fn exists(&self, machine: &str) -> Result<bool>;

    /// Start (creating if needed) the named machine.
    async fn start_host(&self, machine: &str, config: &MachineConfig) -> Result<Arc<dyn Host>>;
}

/// Installs and controls cluster components on a host.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Move binaries and configuration onto the host.
    async fn update_cluster(&self, config: &KubernetesConfig) -> Result<()>;

    async fn setup_certs(&self, config: &KubernetesConfig) -> Result<()>;

    /// Initialize a fresh control plane.
    async fn start_cluster(&self, config: &KubernetesConfig) -> Result<()>;

    /// Restart components of an already initialized control plane.
    async fn restart_cluster(&self, config: &KubernetesConfig) -> Result<()>;

    async fn kubelet_status(&self) -> Result<ServiceStatus>;

    async fn api_server_status(&self, ip: IpAddr, port: u16) -> Result<ServiceStatus>;
}

/// Container image pre-caching.
#[async_trait]
pub trait ImageCache: Send + Sync {
    /// Fetch the images a bootstrapper needs for a Kubernetes version.
    async fn cache_images(&self, kubernetes_version: &str, bootstrapper: &str) -> Result<()>;

    /// Load previously cached images into the container runtime.
    async fn load_cached_images(&self) -> Result<()>;
}

/// Factory for the collaborators of one start run.
pub trait Backend: Send + Sync {
    /// Acquire the provisioning client for a driver.
    fn provisioner(&self, driver: &str) -> Result<Arc<dyn HostProvisioner>>;

    /// Bootstrapper by name, bound to a started host.
    fn bootstrapper(&self, name: &str, host: Arc<dyn Host>) -> Result<Arc<dyn Bootstrapper>>;

    fn image_cache(&self) -> Arc<dyn ImageCache>;
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Command writing `contents` to `path` on a host with root privileges.
pub fn write_file_command(path: &str, contents: &str) -> String {
    let dir = match path.rsplit_once('/') {
        Some((dir, _)) if !dir.is_empty() => dir,
        _ => "/",
    };
    format!(
        "sudo mkdir -p {} && printf %s {} | sudo tee {} > /dev/null",
        shell_quote(dir),
        shell_quote(contents),
        shell_quote(path)
    )
}
