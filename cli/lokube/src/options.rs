//! Immutable options for one start run.
//!
//! Built once from the command line and passed by reference through the
//! sequence. Nothing here is mutated after construction.

use std::net::IpAddr;

use lokube_profile::{
    parse_disk_size_mb, ConfigError, DriverNetwork, ExtraOption, KubernetesConfig, MachineConfig,
};

use crate::backend::kubeadm::BOOTSTRAPPER_KUBEADM;

pub const DEFAULT_PROFILE: &str = "lokube";
pub const DEFAULT_MEMORY_MB: u32 = 2048;
pub const DEFAULT_CPUS: u32 = 2;
pub const DEFAULT_DISK_SIZE: &str = "20g";
pub const DEFAULT_VM_DRIVER: &str = "virtualbox";
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.10.0";
pub const DEFAULT_NODE_NAME: &str = "lokube";
pub const DEFAULT_API_SERVER_PORT: u16 = 8443;
pub const DEFAULT_API_SERVER_NAME: &str = "lokubeCA";
pub const DEFAULT_DNS_DOMAIN: &str = "cluster.local";
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";
pub const DEFAULT_BOOTSTRAPPER: &str = BOOTSTRAPPER_KUBEADM;
pub const DEFAULT_HOST_ONLY_CIDR: &str = "192.168.99.1/24";
pub const DEFAULT_KVM_NETWORK: &str = "default";
pub const DEFAULT_XHYVE_DISK_DRIVER: &str = "ahci-hd";
pub const DEFAULT_NFS_SHARES_ROOT: &str = "/nfsshares";
pub const DEFAULT_MOUNT_TARGET: &str = "/lokube-host";
pub const DEFAULT_ISO_URL: &str =
    "https://storage.googleapis.com/lokube/iso/lokube-v0.26.0.iso";

/// Cluster-level options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOptions {
    /// Requested version; empty selects [`DEFAULT_KUBERNETES_VERSION`].
    pub kubernetes_version: String,
    pub api_server_port: u16,
    pub api_server_name: String,
    pub api_server_names: Vec<String>,
    pub api_server_ips: Vec<IpAddr>,
    pub dns_domain: String,
    pub feature_gates: String,
    pub container_runtime: String,
    pub cri_socket: String,
    pub network_plugin: String,
    pub enable_default_cni: bool,
    pub service_cidr: String,
    pub extra_options: Vec<ExtraOption>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            kubernetes_version: DEFAULT_KUBERNETES_VERSION.to_string(),
            api_server_port: DEFAULT_API_SERVER_PORT,
            api_server_name: DEFAULT_API_SERVER_NAME.to_string(),
            api_server_names: Vec::new(),
            api_server_ips: Vec::new(),
            dns_domain: DEFAULT_DNS_DOMAIN.to_string(),
            feature_gates: String::new(),
            container_runtime: String::new(),
            cri_socket: String::new(),
            network_plugin: String::new(),
            enable_default_cni: false,
            service_cidr: DEFAULT_SERVICE_CIDR.to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// Everything a start run needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOptions {
    pub profile: String,

    pub iso_url: String,
    pub memory_mb: u32,
    pub cpus: u32,
    /// Human-readable disk size (`20g`).
    pub disk_size: String,
    pub vm_driver: String,
    pub network: DriverNetwork,
    pub xhyve_disk_driver: String,
    pub nfs_shares: Vec<String>,
    pub nfs_shares_root: String,
    pub docker_env: Vec<String>,
    pub docker_opt: Vec<String>,
    pub insecure_registry: Vec<String>,
    pub registry_mirror: Vec<String>,
    pub disable_driver_mounts: bool,
    pub uuid: String,
    pub gpu: bool,

    pub cluster: ClusterOptions,
    pub bootstrapper: String,

    pub cache_images: bool,
    pub keep_context: bool,
    pub embed_certs: bool,
    pub mount: bool,
    pub mount_string: String,
    pub verbosity: u8,

    /// Print the root-privilege warning for the no-VM driver.
    pub none_driver_warning: bool,
    /// Hand the home directory to [`StartOptions::sudo_user`] on the no-VM driver.
    pub change_none_user: bool,
    pub sudo_user: Option<String>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            profile: DEFAULT_PROFILE.to_string(),
            iso_url: DEFAULT_ISO_URL.to_string(),
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: DEFAULT_CPUS,
            disk_size: DEFAULT_DISK_SIZE.to_string(),
            vm_driver: DEFAULT_VM_DRIVER.to_string(),
            network: DriverNetwork {
                host_only_cidr: DEFAULT_HOST_ONLY_CIDR.to_string(),
                kvm_network: DEFAULT_KVM_NETWORK.to_string(),
                ..Default::default()
            },
            xhyve_disk_driver: DEFAULT_XHYVE_DISK_DRIVER.to_string(),
            nfs_shares: Vec::new(),
            nfs_shares_root: DEFAULT_NFS_SHARES_ROOT.to_string(),
            docker_env: Vec::new(),
            docker_opt: Vec::new(),
            insecure_registry: Vec::new(),
            registry_mirror: Vec::new(),
            disable_driver_mounts: false,
            uuid: String::new(),
            gpu: false,
            cluster: ClusterOptions::default(),
            bootstrapper: DEFAULT_BOOTSTRAPPER.to_string(),
            cache_images: false,
            keep_context: false,
            embed_certs: false,
            mount: false,
            mount_string: String::new(),
            verbosity: 0,
            none_driver_warning: true,
            change_none_user: false,
            sudo_user: None,
        }
    }
}

impl StartOptions {
    /// Build and validate the machine config.
    ///
    /// Fails on an unparsable or too small disk size, and on GPU passthrough
    /// with a driver that cannot do it.
    pub fn machine_config(&self) -> Result<MachineConfig, ConfigError> {
        let config = MachineConfig {
            iso_url: self.iso_url.clone(),
            memory_mb: self.memory_mb,
            cpus: self.cpus,
            disk_size_mb: parse_disk_size_mb(&self.disk_size)?,
            vm_driver: self.vm_driver.clone(),
            container_runtime: self.cluster.container_runtime.clone(),
            network: self.network.clone(),
            xhyve_disk_driver: self.xhyve_disk_driver.clone(),
            nfs_shares: self.nfs_shares.clone(),
            nfs_shares_root: self.nfs_shares_root.clone(),
            docker_env: self.docker_env.clone(),
            docker_opt: self.docker_opt.clone(),
            insecure_registry: self.insecure_registry.clone(),
            registry_mirror: self.registry_mirror.clone(),
            disable_driver_mounts: self.disable_driver_mounts,
            uuid: self.uuid.clone(),
            gpu: self.gpu,
        };

        config.validate(&self.disk_size)?;
        Ok(config)
    }

    pub fn requested_version(&self) -> &str {
        if self.cluster.kubernetes_version.is_empty() {
            DEFAULT_KUBERNETES_VERSION
        } else {
            &self.cluster.kubernetes_version
        }
    }

    /// Cluster config for a host at `node_ip`, running `version`.
    pub fn kubernetes_config(&self, version: &str, node_ip: &str) -> KubernetesConfig {
        let cluster = &self.cluster;
        KubernetesConfig {
            kubernetes_version: version.to_string(),
            node_ip: node_ip.to_string(),
            node_port: cluster.api_server_port,
            node_name: DEFAULT_NODE_NAME.to_string(),
            api_server_name: cluster.api_server_name.clone(),
            api_server_names: cluster.api_server_names.clone(),
            api_server_ips: cluster.api_server_ips.clone(),
            dns_domain: cluster.dns_domain.clone(),
            feature_gates: cluster.feature_gates.clone(),
            container_runtime: cluster.container_runtime.clone(),
            cri_socket: cluster.cri_socket.clone(),
            network_plugin: cluster.network_plugin.clone(),
            service_cidr: cluster.service_cidr.clone(),
            extra_options: cluster.extra_options.clone(),
            should_load_cached_images: self.cache_images,
            enable_default_cni: cluster.enable_default_cni,
        }
    }

    /// Owner for the no-VM ownership fix-up, if it applies.
    pub fn none_owner(&self) -> Option<&str> {
        if !self.change_none_user {
            return None;
        }
        self.sudo_user.as_deref().filter(|u| !u.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lokube_profile::MINIMUM_DISK_SIZE_MB;
    use rstest::rstest;

    #[test]
    fn test_default_machine_config() {
        let config = StartOptions::default().machine_config().unwrap();
        assert_eq!(config.disk_size_mb, 20000);
        assert_eq!(config.memory_mb, 2048);
        assert_eq!(config.network.host_only_cidr, "192.168.99.1/24");
    }

    #[rstest]
    #[case("2000m", true)]
    #[case("2g", true)]
    #[case("1999m", false)]
    #[case("1g", false)]
    fn test_disk_floor(#[case] disk: &str, #[case] ok: bool) {
        let opts = StartOptions {
            disk_size: disk.to_string(),
            ..Default::default()
        };
        let result = opts.machine_config();
        assert_eq!(result.is_ok(), ok, "{}: {:?}", disk, result);
        if let Err(ConfigError::DiskTooSmall { minimum_mb, .. }) = result {
            assert_eq!(minimum_mb, MINIMUM_DISK_SIZE_MB);
        }
    }

    #[test]
    fn test_gpu_requires_kvm2() {
        let opts = StartOptions {
            gpu: true,
            ..Default::default()
        };
        assert!(matches!(
            opts.machine_config(),
            Err(ConfigError::GpuUnsupportedDriver { .. })
        ));

        let opts = StartOptions {
            gpu: true,
            vm_driver: "kvm2".to_string(),
            ..Default::default()
        };
        assert!(opts.machine_config().unwrap().gpu);
    }

    #[test]
    fn test_empty_version_falls_back() {
        let mut opts = StartOptions::default();
        opts.cluster.kubernetes_version.clear();
        assert_eq!(opts.requested_version(), DEFAULT_KUBERNETES_VERSION);
    }

    #[test]
    fn test_kubernetes_config() {
        let mut opts = StartOptions {
            cache_images: true,
            ..Default::default()
        };
        opts.cluster.container_runtime = "containerd".to_string();

        let config = opts.kubernetes_config("v1.10.0", "192.168.99.100");
        assert_eq!(config.node_ip, "192.168.99.100");
        assert_eq!(config.node_port, 8443);
        assert_eq!(config.node_name, "lokube");
        assert_eq!(config.container_runtime, "containerd");
        assert!(config.should_load_cached_images);
    }

    #[test]
    fn test_none_owner() {
        let opts = StartOptions {
            sudo_user: Some("dev".to_string()),
            ..Default::default()
        };
        assert_eq!(opts.none_owner(), None);

        let opts = StartOptions {
            change_none_user: true,
            ..opts
        };
        assert_eq!(opts.none_owner(), Some("dev"));
    }
}
