//! Start command.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Args};
use colored::Colorize;
use lokube_profile::{DriverNetwork, ExtraOption};

use crate::backend::LocalBackend;
use crate::options::{
    ClusterOptions, StartOptions, DEFAULT_API_SERVER_NAME, DEFAULT_API_SERVER_PORT,
    DEFAULT_BOOTSTRAPPER, DEFAULT_CPUS, DEFAULT_DISK_SIZE, DEFAULT_DNS_DOMAIN,
    DEFAULT_HOST_ONLY_CIDR, DEFAULT_ISO_URL, DEFAULT_KUBERNETES_VERSION, DEFAULT_KVM_NETWORK,
    DEFAULT_MEMORY_MB, DEFAULT_NFS_SHARES_ROOT, DEFAULT_PROFILE, DEFAULT_SERVICE_CIDR,
    DEFAULT_VM_DRIVER, DEFAULT_XHYVE_DISK_DRIVER,
};
use crate::ownership::{CHANGE_NONE_USER_ENV, SUDO_USER_ENV};
use crate::paths::{default_kubeconfig_path, default_mount_string, LokubeHome};
use crate::sequencer::{Sequencer, StartOutcome};

/// Start command - bring up a local single-node cluster.
///
/// Creates the machine if needed, or restarts the cluster components of an
/// existing one.
#[derive(Debug, Args)]
pub struct StartCommand {
    /// Profile (machine) name.
    #[arg(short, long, env = "LOKUBE_PROFILE", default_value = DEFAULT_PROFILE)]
    profile: String,

    /// Location of the boot ISO.
    #[arg(long, default_value = DEFAULT_ISO_URL)]
    iso_url: String,

    /// Memory for the VM in MB.
    #[arg(long, default_value_t = DEFAULT_MEMORY_MB)]
    memory: u32,

    /// Number of CPUs for the VM.
    #[arg(long, default_value_t = DEFAULT_CPUS)]
    cpus: u32,

    /// Disk size for the VM (<number>[b|k|m|g]).
    #[arg(long, default_value = DEFAULT_DISK_SIZE)]
    disk_size: String,

    /// VM driver (virtualbox, kvm2, hyperkit, hyperv, none, ...).
    #[arg(long, env = "LOKUBE_VM_DRIVER", default_value = DEFAULT_VM_DRIVER)]
    vm_driver: String,

    /// Host-only network CIDR (virtualbox).
    #[arg(long, default_value = DEFAULT_HOST_ONLY_CIDR)]
    host_only_cidr: String,

    /// Virtual switch name (hyperv).
    #[arg(long, default_value = "")]
    hyperv_virtual_switch: String,

    /// Libvirt network name (kvm).
    #[arg(long, default_value = DEFAULT_KVM_NETWORK)]
    kvm_network: String,

    /// Disk driver (xhyve).
    #[arg(long, default_value = DEFAULT_XHYVE_DISK_DRIVER)]
    xhyve_disk_driver: String,

    /// Local folder to share with the guest over NFS (hyperkit).
    #[arg(long = "nfs-share")]
    nfs_shares: Vec<String>,

    /// Guest directory the NFS shares are mounted under.
    #[arg(long, default_value = DEFAULT_NFS_SHARES_ROOT)]
    nfs_shares_root: String,

    /// VPNKit socket location (hyperkit).
    #[arg(long, default_value = "")]
    hyperkit_vpnkit_sock: String,

    /// Guest vsock ports exposed as host sockets (hyperkit).
    #[arg(long, value_delimiter = ',')]
    hyperkit_vsock_ports: Vec<String>,

    /// Environment for the container engine (KEY=value).
    #[arg(long)]
    docker_env: Vec<String>,

    /// Extra flag for the container engine.
    #[arg(long)]
    docker_opt: Vec<String>,

    /// Insecure registry the engine may pull from.
    #[arg(long)]
    insecure_registry: Vec<String>,

    /// Registry mirror for the engine.
    #[arg(long, value_delimiter = ',')]
    registry_mirror: Vec<String>,

    /// Disable filesystem mounts provided by the hypervisor.
    #[arg(long)]
    disable_driver_mounts: bool,

    /// Stable hardware UUID for the VM.
    #[arg(long, default_value = "")]
    uuid: String,

    /// Pass NVIDIA GPUs through to the VM (kvm2 only).
    #[arg(long)]
    gpu: bool,

    /// Kubernetes version to run.
    #[arg(long, env = "LOKUBE_KUBERNETES_VERSION", default_value = DEFAULT_KUBERNETES_VERSION)]
    kubernetes_version: String,

    /// API server port.
    #[arg(long = "apiserver-port", default_value_t = DEFAULT_API_SERVER_PORT)]
    api_server_port: u16,

    /// API server name used in the generated certificate.
    #[arg(long = "apiserver-name", default_value = DEFAULT_API_SERVER_NAME)]
    api_server_name: String,

    /// Additional names for the API server certificate.
    #[arg(long = "apiserver-names", value_delimiter = ',')]
    api_server_names: Vec<String>,

    /// Additional IPs for the API server certificate.
    #[arg(long = "apiserver-ips", value_delimiter = ',')]
    api_server_ips: Vec<IpAddr>,

    /// Cluster DNS domain.
    #[arg(long, default_value = DEFAULT_DNS_DOMAIN)]
    dns_domain: String,

    /// Feature gates (key=value pairs, comma separated).
    #[arg(long, default_value = "")]
    feature_gates: String,

    /// Container runtime (docker, crio, cri-o, rkt, containerd).
    #[arg(long, default_value = "")]
    container_runtime: String,

    /// CRI socket path.
    #[arg(long, default_value = "")]
    cri_socket: String,

    /// Kubelet network plugin.
    #[arg(long, default_value = "")]
    network_plugin: String,

    /// Install a default bridge CNI configuration.
    #[arg(long)]
    enable_default_cni: bool,

    /// Service cluster IP range.
    #[arg(long = "service-cluster-ip-range", default_value = DEFAULT_SERVICE_CIDR)]
    service_cidr: String,

    /// Component option as component.key=value (repeatable).
    #[arg(long = "extra-config")]
    extra_config: Vec<ExtraOption>,

    /// Cache the images for the Kubernetes version before bootstrapping.
    #[arg(long)]
    cache_images: bool,

    /// Leave the current kubectl context unchanged.
    #[arg(long)]
    keep_context: bool,

    /// Inline certificate data into the kubeconfig.
    #[arg(long)]
    embed_certs: bool,

    /// Mount a host directory into the cluster.
    #[arg(long)]
    mount: bool,

    /// Directory to mount, as <host path>:<guest path>.
    #[arg(long)]
    mount_string: Option<String>,

    /// Cluster bootstrapper.
    #[arg(long, default_value = DEFAULT_BOOTSTRAPPER)]
    bootstrapper: String,

    /// Print the root-privilege warning for --vm-driver=none.
    #[arg(
        long,
        env = "LOKUBE_WANT_NONE_DRIVER_WARNING",
        default_value_t = true,
        action = ArgAction::Set
    )]
    want_none_driver_warning: bool,
}

impl StartCommand {
    /// Freeze the parsed flags and environment into run options.
    fn options(self, verbosity: u8) -> Result<StartOptions> {
        let mount_string = match self.mount_string {
            Some(s) => s,
            None if self.mount => default_mount_string()?,
            None => String::new(),
        };

        Ok(StartOptions {
            profile: self.profile,
            iso_url: self.iso_url,
            memory_mb: self.memory,
            cpus: self.cpus,
            disk_size: self.disk_size,
            vm_driver: self.vm_driver,
            network: DriverNetwork {
                host_only_cidr: self.host_only_cidr,
                hyperv_virtual_switch: self.hyperv_virtual_switch,
                kvm_network: self.kvm_network,
                hyperkit_vpnkit_sock: self.hyperkit_vpnkit_sock,
                hyperkit_vsock_ports: self.hyperkit_vsock_ports,
            },
            xhyve_disk_driver: self.xhyve_disk_driver,
            nfs_shares: self.nfs_shares,
            nfs_shares_root: self.nfs_shares_root,
            docker_env: self.docker_env,
            docker_opt: self.docker_opt,
            insecure_registry: self.insecure_registry,
            registry_mirror: self.registry_mirror,
            disable_driver_mounts: self.disable_driver_mounts,
            uuid: self.uuid,
            gpu: self.gpu,
            cluster: ClusterOptions {
                kubernetes_version: self.kubernetes_version,
                api_server_port: self.api_server_port,
                api_server_name: self.api_server_name,
                api_server_names: self.api_server_names,
                api_server_ips: self.api_server_ips,
                dns_domain: self.dns_domain,
                feature_gates: self.feature_gates,
                container_runtime: self.container_runtime,
                cri_socket: self.cri_socket,
                network_plugin: self.network_plugin,
                enable_default_cni: self.enable_default_cni,
                service_cidr: self.service_cidr,
                extra_options: self.extra_config,
            },
            bootstrapper: self.bootstrapper,
            cache_images: self.cache_images,
            keep_context: self.keep_context,
            embed_certs: self.embed_certs,
            mount: self.mount,
            mount_string,
            verbosity,
            none_driver_warning: self.want_none_driver_warning,
            change_none_user: env_flag(CHANGE_NONE_USER_ENV),
            sudo_user: std::env::var(SUDO_USER_ENV).ok(),
        })
    }

    pub async fn run(self, verbosity: u8) -> Result<()> {
        let home = LokubeHome::from_env()?;
        let kubeconfig_path = default_kubeconfig_path()?;
        let options = self.options(verbosity)?;

        let backend = Arc::new(LocalBackend::new(home.clone()));
        let outcome = Sequencer::new(backend, home, kubeconfig_path)
            .run(&options)
            .await?;

        print_outcome(&outcome);
        Ok(())
    }
}

/// Set to a non-empty value.
fn env_flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| !v.is_empty())
}

fn context_message(outcome: &StartOutcome) -> String {
    if outcome.kubeconfig.keep_context {
        format!(
            "The local Kubernetes cluster has started. The kubectl context has not been \
             altered, kubectl will require \"--context={}\" to use the new context.",
            outcome.kubeconfig.cluster_name
        )
    } else {
        "Kubectl is now configured to use the cluster.".to_string()
    }
}

fn print_outcome(outcome: &StartOutcome) {
    println!("{}", context_message(outcome));

    if let Some(pid) = outcome.mount_pid {
        println!("Mount helper running (pid {}).", pid);
    }

    println!(
        "{} Kubernetes {} is running ({}).",
        "✓".green(),
        outcome.kubernetes_version,
        outcome.action
    );
}
