//! Container runtime selection.
//!
//! Exactly one container runtime may be active on the host. The selector
//! maps the requested runtime name to its CRI socket endpoints and drives
//! three host-side steps:
//!
//! 1. write the crictl configuration before the cluster starts
//! 2. stop every other runtime's services
//! 3. restart runtimes that only discover plugin/hook directories at their
//!    own startup, after bootstrap files have been written
//!
//! Every host-side failure here is advisory: it is logged and the sequence
//! continues.

use std::fmt;

use anyhow::Result;
use tracing::{info, warn};

use crate::backend::{write_file_command, Host};

/// Where crictl reads its configuration.
pub const CRICTL_CONFIG_PATH: &str = "/etc/crictl.yaml";

const CRIO_SOCKET: &str = "unix:///var/run/crio/crio.sock";
const CONTAINERD_SOCKET: &str = "unix:///run/containerd/containerd.sock";

/// Supported container runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    CriO,
    Rkt,
    Containerd,
}

impl ContainerRuntime {
    pub const ALL: [ContainerRuntime; 4] = [Self::Docker, Self::CriO, Self::Rkt, Self::Containerd];

    /// Resolve a runtime name. Empty selects docker, the default engine.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "" | "docker" => Some(Self::Docker),
            "crio" | "cri-o" => Some(Self::CriO),
            "rkt" => Some(Self::Rkt),
            "containerd" => Some(Self::Containerd),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::CriO => "crio",
            Self::Rkt => "rkt",
            Self::Containerd => "containerd",
        }
    }

    /// systemd units to stop, in order.
    pub fn units(&self) -> &'static [&'static str] {
        match self {
            Self::Docker => &["docker", "docker.socket"],
            Self::CriO => &["crio"],
            Self::Rkt => &["rkt-api", "rkt-metadata"],
            Self::Containerd => &["containerd"],
        }
    }

    /// Runtimes that scan plugin/hook directories only when they start.
    pub fn needs_restart_after_bootstrap(&self) -> bool {
        matches!(self, Self::CriO | Self::Containerd)
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CRI socket endpoints for crictl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriEndpoints {
    pub runtime_endpoint: &'static str,
    pub image_endpoint: &'static str,
}

impl CriEndpoints {
    /// crictl configuration, keys sorted.
    pub fn to_crictl_yaml(&self) -> String {
        format!(
            "image-endpoint: {}\nruntime-endpoint: {}\n",
            self.image_endpoint, self.runtime_endpoint
        )
    }
}

/// Supplementary crictl config for a runtime name.
///
/// Only `crio`, `cri-o` and `containerd` have one; anything else, including
/// the empty string, yields `None`.
pub fn cri_endpoints(name: &str) -> Option<CriEndpoints> {
    let socket = match name {
        "crio" | "cri-o" => CRIO_SOCKET,
        "containerd" => CONTAINERD_SOCKET,
        _ => return None,
    };
    Some(CriEndpoints {
        runtime_endpoint: socket,
        image_endpoint: socket,
    })
}

/// Runtime choice for one start run.
#[derive(Debug, Clone)]
pub struct RuntimeSelector {
    requested: String,
    selected: Option<ContainerRuntime>,
}

impl RuntimeSelector {
    pub fn new(requested: &str) -> Self {
        Self {
            requested: requested.to_string(),
            selected: ContainerRuntime::from_name(requested),
        }
    }

    /// The runtime that stays active, if the name is recognized.
    pub fn selected(&self) -> Option<ContainerRuntime> {
        self.selected
    }

    pub fn endpoints(&self) -> Option<CriEndpoints> {
        cri_endpoints(&self.requested)
    }

    /// Write the crictl config, if the runtime has one.
    ///
    /// Returns `Ok(false)` when there is nothing to write.
    pub async fn write_crictl_config(&self, host: &dyn Host) -> Result<bool> {
        let Some(endpoints) = self.endpoints() else {
            return Ok(false);
        };

        println!("Writing crictl config...");
        let command = write_file_command(CRICTL_CONFIG_PATH, &endpoints.to_crictl_yaml());
        host.run_command(&command).await?;
        Ok(true)
    }

    /// Stop every runtime other than the selected one.
    ///
    /// A runtime's units are stopped in order; the first failing unit ends
    /// that runtime's attempt. Returns the runtimes that failed to stop.
    pub async fn stop_others(&self, host: &dyn Host) -> Vec<ContainerRuntime> {
        let mut failed = Vec::new();

        for runtime in ContainerRuntime::ALL {
            if Some(runtime) == self.selected {
                continue;
            }
            if let Err(e) = stop_runtime(host, runtime).await {
                warn!(runtime = %runtime, error = %e, "Error stopping container runtime");
                failed.push(runtime);
            }
        }

        failed
    }

    /// Restart the selected runtime if it must rescan its plugin directories.
    ///
    /// Returns `Ok(false)` when no restart is needed.
    pub async fn restart_selected(&self, host: &dyn Host) -> Result<bool> {
        let Some(runtime) = self.selected.filter(|r| r.needs_restart_after_bootstrap()) else {
            return Ok(false);
        };

        println!("Restarting {} runtime...", runtime);
        for unit in runtime.units() {
            host.run_command(&format!("sudo systemctl restart {}", unit))
                .await?;
        }
        info!(runtime = %runtime, "Restarted container runtime");
        Ok(true)
    }
}

async fn stop_runtime(host: &dyn Host, runtime: ContainerRuntime) -> Result<()> {
    for unit in runtime.units() {
        host.run_command(&format!("sudo systemctl stop {}", unit))
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockHost;
    use rstest::rstest;

    #[rstest]
    #[case("crio", CRIO_SOCKET)]
    #[case("cri-o", CRIO_SOCKET)]
    #[case("containerd", CONTAINERD_SOCKET)]
    fn test_endpoint_mapping(#[case] name: &str, #[case] socket: &str) {
        let endpoints = cri_endpoints(name).unwrap();
        assert_eq!(endpoints.runtime_endpoint, socket);
        assert_eq!(endpoints.image_endpoint, socket);
    }

    #[rstest]
    #[case("")]
    #[case("docker")]
    #[case("rkt")]
    #[case("gvisor")]
    fn test_no_supplementary_config(#[case] name: &str) {
        assert!(cri_endpoints(name).is_none());
    }

    #[test]
    fn test_crio_socket_value() {
        let endpoints = cri_endpoints("crio").unwrap();
        assert_eq!(endpoints.runtime_endpoint, "unix:///var/run/crio/crio.sock");
        assert_eq!(
            endpoints.to_crictl_yaml(),
            "image-endpoint: unix:///var/run/crio/crio.sock\nruntime-endpoint: unix:///var/run/crio/crio.sock\n"
        );
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ContainerRuntime::from_name(""), Some(ContainerRuntime::Docker));
        assert_eq!(ContainerRuntime::from_name("cri-o"), Some(ContainerRuntime::CriO));
        assert_eq!(ContainerRuntime::from_name("lxc"), None);
    }

    #[tokio::test]
    async fn test_stop_others_keeps_selected() {
        let host = MockHost::new("lokube");
        let failed = RuntimeSelector::new("containerd").stop_others(&host).await;

        assert!(failed.is_empty());
        assert_eq!(
            host.commands(),
            vec![
                "sudo systemctl stop docker",
                "sudo systemctl stop docker.socket",
                "sudo systemctl stop crio",
                "sudo systemctl stop rkt-api",
                "sudo systemctl stop rkt-metadata",
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_failure_is_reported_and_continues() {
        let host = MockHost::new("lokube").failing_command("stop docker");
        let failed = RuntimeSelector::new("crio").stop_others(&host).await;

        assert_eq!(failed, vec![ContainerRuntime::Docker]);
        let commands = host.commands();
        assert!(!commands.iter().any(|c| c.contains("docker.socket")));
        assert!(commands.iter().any(|c| c.contains("stop containerd")));
    }

    #[tokio::test]
    async fn test_unknown_runtime_stops_all() {
        let host = MockHost::new("lokube");
        RuntimeSelector::new("gvisor").stop_others(&host).await;
        assert_eq!(host.commands().len(), 6);
    }

    #[tokio::test]
    async fn test_restart_only_for_plugin_runtimes() {
        let host = MockHost::new("lokube");
        assert!(RuntimeSelector::new("cri-o").restart_selected(&host).await.unwrap());
        assert!(!RuntimeSelector::new("").restart_selected(&host).await.unwrap());
        assert_eq!(host.commands(), vec!["sudo systemctl restart crio"]);
    }

    #[tokio::test]
    async fn test_crictl_config_written_only_with_mapping() {
        let host = MockHost::new("lokube");
        assert!(!RuntimeSelector::new("docker").write_crictl_config(&host).await.unwrap());
        assert!(RuntimeSelector::new("containerd").write_crictl_config(&host).await.unwrap());

        let commands = host.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains(CRICTL_CONFIG_PATH));
        assert!(commands[0].contains(CONTAINERD_SOCKET));
    }
}
