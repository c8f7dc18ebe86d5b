//! Machine and cluster configuration value objects.
//!
//! Both structs are built once per start run and never mutated afterwards.
//! Field order is the serialization order of the profile document, so it
//! must not be shuffled.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::disk::MINIMUM_DISK_SIZE_MB;
use crate::error::ConfigError;

/// Driver that runs cluster components directly on the local host.
pub const DRIVER_NONE: &str = "none";

/// The only driver with GPU passthrough support.
pub const DRIVER_KVM2: &str = "kvm2";

/// Components accepted by `--extra-config`.
pub const EXTRA_OPTION_COMPONENTS: &[&str] = &[
    "kubelet",
    "apiserver",
    "controller-manager",
    "etcd",
    "proxy",
    "scheduler",
];

/// Driver-specific network settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverNetwork {
    /// Host-only CIDR (virtualbox).
    pub host_only_cidr: String,

    /// Virtual switch name (hyperv).
    pub hyperv_virtual_switch: String,

    /// Libvirt network name (kvm).
    pub kvm_network: String,

    /// VPNKit socket location (hyperkit).
    pub hyperkit_vpnkit_sock: String,

    /// Guest vsock ports exposed as host sockets (hyperkit).
    pub hyperkit_vsock_ports: Vec<String>,
}

/// VM provisioning parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// ISO image location.
    pub iso_url: String,

    /// Memory in MB.
    pub memory_mb: u32,

    /// Number of virtual CPUs.
    pub cpus: u32,

    /// Disk size in MB.
    pub disk_size_mb: u64,

    /// Driver identifier (`virtualbox`, `kvm2`, `none`, ...).
    pub vm_driver: String,

    /// Requested container runtime name.
    pub container_runtime: String,

    pub network: DriverNetwork,

    /// Disk driver (xhyve).
    pub xhyve_disk_driver: String,

    /// Local folders shared with the guest over NFS (hyperkit).
    pub nfs_shares: Vec<String>,

    /// Guest root for NFS shares.
    pub nfs_shares_root: String,

    /// Environment for the container engine (`KEY=value`).
    pub docker_env: Vec<String>,

    /// Extra flags for the container engine.
    pub docker_opt: Vec<String>,

    pub insecure_registry: Vec<String>,

    pub registry_mirror: Vec<String>,

    /// Disable hypervisor-provided filesystem mounts.
    pub disable_driver_mounts: bool,

    /// Stable hardware UUID (restores the MAC address on hyperkit).
    pub uuid: String,

    /// NVIDIA GPU passthrough.
    pub gpu: bool,
}

impl MachineConfig {
    /// Check the invariants that must hold before any VM action.
    ///
    /// `requested_disk` is the human-readable size, quoted in the error.
    pub fn validate(&self, requested_disk: &str) -> Result<(), ConfigError> {
        if self.disk_size_mb < MINIMUM_DISK_SIZE_MB {
            return Err(ConfigError::DiskTooSmall {
                size_mb: self.disk_size_mb,
                requested: requested_disk.to_string(),
                minimum_mb: MINIMUM_DISK_SIZE_MB,
            });
        }

        if self.gpu && self.vm_driver != DRIVER_KVM2 {
            return Err(ConfigError::GpuUnsupportedDriver {
                driver: self.vm_driver.clone(),
            });
        }

        Ok(())
    }

    /// Returns true if cluster components run on the local host.
    pub fn is_no_vm(&self) -> bool {
        self.vm_driver == DRIVER_NONE
    }
}

/// Per-component option passed through to the cluster bootstrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOption {
    pub component: String,
    pub key: String,
    pub value: String,
}

impl ExtraOption {
    pub fn new(
        component: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            component: component.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ExtraOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}={}", self.component, self.key, self.value)
    }
}

impl FromStr for ExtraOption {
    type Err = ConfigError;

    /// Parse `component.key=value`; the key may contain further dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidExtraOption {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| invalid("expected component.key=value"))?;
        let (component, key) = path
            .split_once('.')
            .ok_or_else(|| invalid("key must be prefixed with a component and a dot"))?;

        if !EXTRA_OPTION_COMPONENTS.contains(&component) {
            return Err(invalid(&format!(
                "unknown component, expected one of: {}",
                EXTRA_OPTION_COMPONENTS.join(", ")
            )));
        }
        if key.is_empty() {
            return Err(invalid("key cannot be empty"));
        }

        Ok(Self::new(component, key, value))
    }
}

/// Cluster parameters handed to the bootstrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// `vMAJOR.MINOR.PATCH`.
    pub kubernetes_version: String,

    /// Control-plane node address.
    pub node_ip: String,

    /// API server port.
    pub node_port: u16,

    pub node_name: String,

    /// Name used in the API server certificate.
    pub api_server_name: String,

    /// Additional certificate names.
    pub api_server_names: Vec<String>,

    /// Additional certificate IPs.
    pub api_server_ips: Vec<IpAddr>,

    pub dns_domain: String,

    pub feature_gates: String,

    pub container_runtime: String,

    pub cri_socket: String,

    pub network_plugin: String,

    pub service_cidr: String,

    /// Insertion-ordered; order carries no meaning but is preserved.
    pub extra_options: Vec<ExtraOption>,

    pub should_load_cached_images: bool,

    pub enable_default_cni: bool,
}

/// Durable desired state for one named profile.
///
/// The first save of a run carries only the machine config, so a crash
/// before the cluster identity is known still keeps the VM settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDocument {
    pub machine_config: MachineConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_config: Option<KubernetesConfig>,
}

impl ProfileDocument {
    /// Document holding only the machine config.
    pub fn machine_only(machine_config: MachineConfig) -> Self {
        Self {
            machine_config,
            kubernetes_config: None,
        }
    }

    /// Document holding both configs.
    pub fn complete(machine_config: MachineConfig, kubernetes_config: KubernetesConfig) -> Self {
        Self {
            machine_config,
            kubernetes_config: Some(kubernetes_config),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn machine(disk_size_mb: u64, driver: &str, gpu: bool) -> MachineConfig {
        MachineConfig {
            disk_size_mb,
            vm_driver: driver.to_string(),
            gpu,
            ..Default::default()
        }
    }

    #[rstest]
    #[case(MINIMUM_DISK_SIZE_MB)]
    #[case(MINIMUM_DISK_SIZE_MB + 1)]
    #[case(20_000)]
    fn test_disk_at_or_above_floor_passes(#[case] size: u64) {
        assert!(machine(size, "virtualbox", false).validate("x").is_ok());
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(MINIMUM_DISK_SIZE_MB - 1)]
    fn test_disk_below_floor_fails(#[case] size: u64) {
        let err = machine(size, "virtualbox", false).validate("1g").unwrap_err();
        assert!(matches!(err, ConfigError::DiskTooSmall { size_mb, .. } if size_mb == size));
        assert!(err.to_string().contains("minimum disk size"));
    }

    #[test]
    fn test_gpu_requires_kvm2() {
        assert!(machine(20_000, "kvm2", true).validate("20g").is_ok());
        let err = machine(20_000, "virtualbox", true).validate("20g").unwrap_err();
        assert!(matches!(err, ConfigError::GpuUnsupportedDriver { .. }));
    }

    #[test]
    fn test_extra_option_parse() {
        let opt: ExtraOption = "kubelet.eviction-hard.memory=100Mi".parse().unwrap();
        assert_eq!(opt.component, "kubelet");
        assert_eq!(opt.key, "eviction-hard.memory");
        assert_eq!(opt.value, "100Mi");
        assert_eq!(opt.to_string(), "kubelet.eviction-hard.memory=100Mi");
    }

    #[rstest]
    #[case("kubelet.max-pods")]
    #[case("max-pods=10")]
    #[case("dashboard.port=80")]
    #[case("apiserver.=x")]
    fn test_extra_option_rejects(#[case] input: &str) {
        assert!(input.parse::<ExtraOption>().is_err());
    }

    #[test]
    fn test_machine_only_omits_cluster_section() {
        let doc = ProfileDocument::machine_only(machine(20_000, "none", false));
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.get("kubernetes_config").is_none());
        assert!(doc.machine_config.is_no_vm());
    }
}
