//! No-VM driver: cluster components run directly on this machine.

use std::fs;
use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lokube_profile::{MachineConfig, DRIVER_NONE};
use tokio::process::Command;
use tracing::{debug, info};

use super::kubeadm::{KubeadmBootstrapper, KubeadmImageCache, BOOTSTRAPPER_KUBEADM};
use super::{Backend, Bootstrapper, Host, HostProvisioner, ImageCache};
use crate::paths::LokubeHome;

/// Engine port reported in host URLs.
const ENGINE_PORT: u16 = 2376;

/// The local machine, reached through `sh -c`.
#[derive(Debug, Clone)]
pub struct LocalHost {
    name: String,
}

impl LocalHost {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

/// First non-loopback address in `hostname -I` output.
fn first_routable_ip(output: &str) -> Option<IpAddr> {
    output
        .split_whitespace()
        .filter_map(|s| s.parse::<IpAddr>().ok())
        .find(|ip| !ip.is_loopback())
}

#[async_trait]
impl Host for LocalHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ip(&self) -> Result<String> {
        let ip = match self.run_command("hostname -I").await {
            Ok(output) => first_routable_ip(&output),
            Err(e) => {
                debug!(error = %e, "hostname -I failed, using loopback");
                None
            }
        };
        Ok(ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string()))
    }

    async fn url(&self) -> Result<String> {
        let ip = self.ip().await?;
        Ok(format!("tcp://{}:{}", ip, ENGINE_PORT))
    }

    async fn run_command(&self, command: &str) -> Result<String> {
        debug!(command = %command, "Running local command");

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .with_context(|| format!("failed to spawn sh for {:?}", command))?;

        if !output.status.success() {
            bail!(
                "command {:?} failed with {}: {}",
                command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Provisioner for the no-VM driver.
pub struct LocalProvisioner {
    home: LokubeHome,
}

impl LocalProvisioner {
    pub fn new(home: LokubeHome) -> Self {
        Self { home }
    }
}

#[async_trait]
impl HostProvisioner for LocalProvisioner {
    async fn exists(&self, machine: &str) -> Result<bool> {
        Ok(self.home.machine_marker(machine).exists())
    }

    async fn start_host(&self, machine: &str, config: &MachineConfig) -> Result<Arc<dyn Host>> {
        let host = LocalHost::new(machine);
        let kernel = host
            .run_command("uname -sr")
            .await
            .context("local command channel unavailable")?;

        let marker = self.home.machine_marker(machine);
        if let Some(dir) = marker.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&marker, config.vm_driver.as_bytes())
            .with_context(|| format!("failed to write {:?}", marker))?;

        info!(machine = %machine, kernel = %kernel.trim(), "Local host ready");
        Ok(Arc::new(host))
    }
}

/// Backend for drivers with an in-tree provisioner.
pub struct LocalBackend {
    home: LokubeHome,
}

impl LocalBackend {
    pub fn new(home: LokubeHome) -> Self {
        Self { home }
    }
}

impl Backend for LocalBackend {
    fn provisioner(&self, driver: &str) -> Result<Arc<dyn HostProvisioner>> {
        if driver != DRIVER_NONE {
            return Err(anyhow!(
                "no provisioning plugin for driver {:?}; this build supports --vm-driver={}",
                driver,
                DRIVER_NONE
            ));
        }
        Ok(Arc::new(LocalProvisioner::new(self.home.clone())))
    }

    fn bootstrapper(&self, name: &str, host: Arc<dyn Host>) -> Result<Arc<dyn Bootstrapper>> {
        match name {
            BOOTSTRAPPER_KUBEADM => Ok(Arc::new(KubeadmBootstrapper::new(host)?)),
            other => Err(anyhow!("unknown bootstrapper: {}", other)),
        }
    }

    fn image_cache(&self) -> Arc<dyn ImageCache> {
        Arc::new(KubeadmImageCache::new(
            Arc::new(LocalHost::new("local")),
            self.home.image_cache_dir(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_routable_ip() {
        assert_eq!(
            first_routable_ip("127.0.0.1 10.0.2.15 172.17.0.1\n"),
            Some("10.0.2.15".parse().unwrap())
        );
        assert_eq!(first_routable_ip("::1"), None);
        assert_eq!(first_routable_ip(""), None);
    }

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let host = LocalHost::new("local");
        let out = host.run_command("echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_nonzero_exit_is_error() {
        let host = LocalHost::new("local");
        let err = host.run_command("echo oops >&2; exit 3").await.unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_provisioner_records_machine() {
        let dir = tempfile::tempdir().unwrap();
        let home = LokubeHome::new(dir.path());
        let provisioner = LocalProvisioner::new(home.clone());
        let config = MachineConfig {
            vm_driver: DRIVER_NONE.to_string(),
            ..Default::default()
        };

        assert!(!provisioner.exists("lokube").await.unwrap());
        provisioner.start_host("lokube", &config).await.unwrap();
        assert!(provisioner.exists("lokube").await.unwrap());
    }

    #[test]
    fn test_vm_drivers_have_no_provisioner() {
        let backend = LocalBackend::new(LokubeHome::new("/tmp/lokube-test"));
        assert!(backend.provisioner("virtualbox").is_err());
        assert!(backend.provisioner(DRIVER_NONE).is_ok());
    }
}
