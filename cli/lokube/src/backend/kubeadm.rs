//! kubeadm-driven bootstrapper and image cache.
//!
//! Both work purely over a [`Host`] command channel, so they behave the same
//! whether the host is the local machine or a VM reached over SSH.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lokube_profile::KubernetesConfig;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{shell_quote, write_file_command, Bootstrapper, Host, ImageCache, ServiceStatus};
use crate::runtime::cri_endpoints;

/// Name selecting this bootstrapper.
pub const BOOTSTRAPPER_KUBEADM: &str = "kubeadm";

/// Rendered kubeadm configuration on the host.
pub const KUBEADM_CONFIG_PATH: &str = "/var/lib/kubeadm.yaml";

const CERTS_DIR: &str = "/var/lib/lokube/certs/";
const ETCD_DATA_DIR: &str = "/data/lokube";
const KUBELET_DROPIN_PATH: &str = "/etc/systemd/system/kubelet.service.d/10-lokube.conf";
const DEFAULT_CNI_PATH: &str = "/etc/cni/net.d/k8s.conf";

/// kubeadm phases that bring an initialized control plane back up.
const RESTART_PHASES: &[&str] = &["kubeconfig all", "controlplane all", "etcd local"];

const DEFAULT_CNI_CONFIG: &str = r#"{
  "cniVersion": "0.3.0",
  "name": "rkt.kubernetes.io",
  "type": "bridge",
  "bridge": "mybridge",
  "mtu": 1460,
  "addIf": "true",
  "isGateway": true,
  "ipMasq": true,
  "ipam": {
    "type": "host-local",
    "subnet": "10.1.0.0/16",
    "gateway": "10.1.0.1",
    "routes": [{ "dst": "0.0.0.0/0" }]
  }
}
"#;

/// Timeout for one API server health probe.
const HEALTHZ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiEndpoint {
    advertise_address: String,
    bind_port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Networking {
    service_subnet: String,
    dns_domain: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Etcd {
    data_dir: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra_args: BTreeMap<String, String>,
}

/// kubeadm `MasterConfiguration` (v1alpha1).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MasterConfiguration {
    api_version: &'static str,
    kind: &'static str,
    api: ApiEndpoint,
    kubernetes_version: String,
    certificates_dir: &'static str,
    networking: Networking,
    etcd: Etcd,
    node_name: String,
    #[serde(rename = "apiServerCertSANs")]
    api_server_cert_sans: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cri_socket: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    api_server_extra_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    controller_manager_extra_args: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    scheduler_extra_args: BTreeMap<String, String>,
}

/// Render the kubeadm configuration for a cluster.
pub fn render_kubeadm_config(config: &KubernetesConfig) -> Result<String> {
    let mut api_server = BTreeMap::new();
    let mut controller_manager = BTreeMap::new();
    let mut scheduler = BTreeMap::new();
    let mut etcd = BTreeMap::new();

    if !config.feature_gates.is_empty() {
        for args in [&mut api_server, &mut controller_manager, &mut scheduler] {
            args.insert("feature-gates".to_string(), config.feature_gates.clone());
        }
    }

    for opt in &config.extra_options {
        let target = match opt.component.as_str() {
            "apiserver" => &mut api_server,
            "controller-manager" => &mut controller_manager,
            "scheduler" => &mut scheduler,
            "etcd" => &mut etcd,
            // kubelet options go to the systemd drop-in
            "kubelet" => continue,
            other => {
                warn!(
                    component = %other,
                    key = %opt.key,
                    "Extra option not supported by kubeadm, ignoring"
                );
                continue;
            }
        };
        target.insert(opt.key.clone(), opt.value.clone());
    }

    let mut sans = vec![config.api_server_name.clone()];
    sans.extend(config.api_server_names.iter().cloned());
    sans.extend(config.api_server_ips.iter().map(|ip| ip.to_string()));
    sans.retain(|s| !s.is_empty());

    let master = MasterConfiguration {
        api_version: "kubeadm.k8s.io/v1alpha1",
        kind: "MasterConfiguration",
        api: ApiEndpoint {
            advertise_address: config.node_ip.clone(),
            bind_port: config.node_port,
        },
        kubernetes_version: config.kubernetes_version.clone(),
        certificates_dir: CERTS_DIR,
        networking: Networking {
            service_subnet: config.service_cidr.clone(),
            dns_domain: config.dns_domain.clone(),
        },
        etcd: Etcd {
            data_dir: ETCD_DATA_DIR.to_string(),
            extra_args: etcd,
        },
        node_name: config.node_name.clone(),
        api_server_cert_sans: sans,
        cri_socket: (!config.cri_socket.is_empty()).then(|| config.cri_socket.clone()),
        api_server_extra_args: api_server,
        controller_manager_extra_args: controller_manager,
        scheduler_extra_args: scheduler,
    };

    serde_yaml::to_string(&master).context("failed to render kubeadm config")
}

/// Render the kubelet systemd drop-in.
pub fn render_kubelet_dropin(config: &KubernetesConfig) -> String {
    let mut args = vec![
        format!("--node-ip={}", config.node_ip),
        format!("--hostname-override={}", config.node_name),
    ];

    if !config.feature_gates.is_empty() {
        args.push(format!("--feature-gates={}", config.feature_gates));
    }
    if !config.network_plugin.is_empty() {
        args.push(format!("--network-plugin={}", config.network_plugin));
    }

    let endpoint = if config.cri_socket.is_empty() {
        cri_endpoints(&config.container_runtime).map(|e| e.runtime_endpoint.to_string())
    } else {
        Some(config.cri_socket.clone())
    };
    if let Some(endpoint) = endpoint {
        args.push("--container-runtime=remote".to_string());
        args.push(format!("--container-runtime-endpoint={}", endpoint));
        args.push(format!("--image-service-endpoint={}", endpoint));
    }

    args.extend(
        config
            .extra_options
            .iter()
            .filter(|o| o.component == "kubelet")
            .map(|o| format!("--{}={}", o.key, o.value)),
    );

    format!(
        "[Service]\nEnvironment=\"KUBELET_EXTRA_ARGS={}\"\n",
        args.join(" ")
    )
}

/// Map `systemctl is-active` output to a status.
fn parse_unit_state(output: &str) -> ServiceStatus {
    match output.trim() {
        "active" => ServiceStatus::Running,
        "inactive" | "deactivating" | "activating" => ServiceStatus::Stopped,
        "failed" => ServiceStatus::Error,
        _ => ServiceStatus::Unknown,
    }
}

/// Bootstrapper issuing kubeadm commands over a host's command channel.
pub struct KubeadmBootstrapper {
    host: Arc<dyn Host>,
    http: reqwest::Client,
}

impl KubeadmBootstrapper {
    pub fn new(host: Arc<dyn Host>) -> Result<Self> {
        // The API server serves a self-signed certificate until kubeconfig setup.
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(HEALTHZ_TIMEOUT)
            .build()
            .context("failed to build health check client")?;

        Ok(Self { host, http })
    }

    async fn run(&self, command: &str) -> Result<String> {
        debug!(host = %self.host.name(), command = %command, "kubeadm command");
        self.host.run_command(command).await
    }

    fn kubeadm(subcommand: &str) -> String {
        format!(
            "sudo kubeadm {} --config {}",
            subcommand,
            shell_quote(KUBEADM_CONFIG_PATH)
        )
    }
}

#[async_trait]
impl Bootstrapper for KubeadmBootstrapper {
    async fn update_cluster(&self, config: &KubernetesConfig) -> Result<()> {
        let kubeadm_config = render_kubeadm_config(config)?;
        self.run(&write_file_command(KUBEADM_CONFIG_PATH, &kubeadm_config))
            .await?;
        self.run(&write_file_command(
            KUBELET_DROPIN_PATH,
            &render_kubelet_dropin(config),
        ))
        .await?;

        if config.enable_default_cni {
            self.run(&write_file_command(DEFAULT_CNI_PATH, DEFAULT_CNI_CONFIG))
                .await?;
        }

        self.run("sudo systemctl daemon-reload").await?;
        info!(version = %config.kubernetes_version, "Cluster files updated");
        Ok(())
    }

    async fn setup_certs(&self, _config: &KubernetesConfig) -> Result<()> {
        self.run(&Self::kubeadm("alpha phase certs all")).await?;
        Ok(())
    }

    async fn start_cluster(&self, _config: &KubernetesConfig) -> Result<()> {
        self.run(&Self::kubeadm("init --ignore-preflight-errors=all"))
            .await?;
        Ok(())
    }

    async fn restart_cluster(&self, _config: &KubernetesConfig) -> Result<()> {
        for phase in RESTART_PHASES {
            self.run(&Self::kubeadm(&format!("alpha phase {}", phase)))
                .await
                .with_context(|| format!("kubeadm phase {:?} failed", phase))?;
        }
        Ok(())
    }

    async fn kubelet_status(&self) -> Result<ServiceStatus> {
        let output = self.run("sudo systemctl is-active kubelet || true").await?;
        Ok(parse_unit_state(&output))
    }

    async fn api_server_status(&self, ip: IpAddr, port: u16) -> Result<ServiceStatus> {
        let url = format!("https://{}/healthz", SocketAddr::new(ip, port));

        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(ServiceStatus::Running),
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "API server unhealthy");
                Ok(ServiceStatus::Error)
            }
            Err(e) => {
                debug!(url = %url, error = %e, "API server unreachable");
                Ok(ServiceStatus::Stopped)
            }
        }
    }
}

/// Image cache backed by kubeadm's image list and `docker load`.
pub struct KubeadmImageCache {
    host: Arc<dyn Host>,
    cache_dir: PathBuf,
}

impl KubeadmImageCache {
    pub fn new(host: Arc<dyn Host>, cache_dir: PathBuf) -> Self {
        Self { host, cache_dir }
    }
}

#[async_trait]
impl ImageCache for KubeadmImageCache {
    async fn cache_images(&self, kubernetes_version: &str, bootstrapper: &str) -> Result<()> {
        if bootstrapper != BOOTSTRAPPER_KUBEADM {
            bail!("image caching is not supported for bootstrapper {:?}", bootstrapper);
        }

        self.host
            .run_command(&format!(
                "sudo kubeadm config images pull --kubernetes-version {}",
                shell_quote(kubernetes_version)
            ))
            .await?;
        info!(version = %kubernetes_version, "Cached images");
        Ok(())
    }

    async fn load_cached_images(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {:?}", self.cache_dir))
            }
        };

        let mut failed = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("tar") {
                continue;
            }

            let command = format!("sudo docker load -i {}", shell_quote(&path.to_string_lossy()));
            if let Err(e) = self.host.run_command(&command).await {
                warn!(image = %path.display(), error = %e, "Failed to load cached image");
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("{} cached images failed to load", failed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockHost;
    use lokube_profile::ExtraOption;

    fn cluster() -> KubernetesConfig {
        KubernetesConfig {
            kubernetes_version: "v1.10.0".to_string(),
            node_ip: "192.168.99.100".to_string(),
            node_port: 8443,
            node_name: "lokube".to_string(),
            api_server_name: "lokubeCA".to_string(),
            api_server_ips: vec!["10.0.0.1".parse().unwrap()],
            dns_domain: "cluster.local".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
            container_runtime: "containerd".to_string(),
            extra_options: vec![
                ExtraOption::new("apiserver", "audit-log-maxage", "30"),
                ExtraOption::new("kubelet", "max-pods", "50"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_render_kubeadm_config() {
        let yaml = render_kubeadm_config(&cluster()).unwrap();

        assert!(yaml.contains("kind: MasterConfiguration"));
        assert!(yaml.contains("advertiseAddress: 192.168.99.100"));
        assert!(yaml.contains("bindPort: 8443"));
        assert!(yaml.contains("kubernetesVersion: v1.10.0"));
        assert!(yaml.contains("audit-log-maxage: '30'"));
        assert!(yaml.contains("- 10.0.0.1"));
        assert!(!yaml.contains("max-pods"));
        assert!(!yaml.contains("criSocket"));
    }

    #[test]
    fn test_render_kubelet_dropin() {
        let dropin = render_kubelet_dropin(&cluster());

        assert!(dropin.contains("--container-runtime=remote"));
        assert!(dropin.contains("--container-runtime-endpoint=unix:///run/containerd/containerd.sock"));
        assert!(dropin.contains("--max-pods=50"));
        assert!(dropin.starts_with("[Service]\n"));
    }

    #[test]
    fn test_parse_unit_state() {
        assert_eq!(parse_unit_state("active\n"), ServiceStatus::Running);
        assert_eq!(parse_unit_state("inactive"), ServiceStatus::Stopped);
        assert_eq!(parse_unit_state("failed"), ServiceStatus::Error);
        assert_eq!(parse_unit_state(""), ServiceStatus::Unknown);
    }

    #[tokio::test]
    async fn test_restart_runs_phases_in_order() {
        let host = Arc::new(MockHost::new("lokube"));
        let bootstrapper = KubeadmBootstrapper::new(host.clone()).unwrap();

        bootstrapper.restart_cluster(&cluster()).await.unwrap();

        let commands = host.commands();
        assert_eq!(commands.len(), RESTART_PHASES.len());
        assert!(commands[0].contains("alpha phase kubeconfig all"));
        assert!(commands[2].contains("alpha phase etcd local"));
    }

    #[tokio::test]
    async fn test_update_cluster_writes_files() {
        let host = Arc::new(MockHost::new("lokube"));
        let bootstrapper = KubeadmBootstrapper::new(host.clone()).unwrap();
        let config = KubernetesConfig {
            enable_default_cni: true,
            ..cluster()
        };

        bootstrapper.update_cluster(&config).await.unwrap();

        let commands = host.commands();
        assert!(commands[0].contains(KUBEADM_CONFIG_PATH));
        assert!(commands[1].contains(KUBELET_DROPIN_PATH));
        assert!(commands[2].contains(DEFAULT_CNI_PATH));
        assert_eq!(commands[3], "sudo systemctl daemon-reload");
    }

    #[tokio::test]
    async fn test_load_cached_images_skips_missing_dir() {
        let host = Arc::new(MockHost::new("lokube"));
        let cache =
            KubeadmImageCache::new(host.clone(), PathBuf::from("/nonexistent/lokube/cache"));

        cache.load_cached_images().await.unwrap();
        assert!(host.commands().is_empty());
    }

    #[tokio::test]
    async fn test_load_cached_images_loads_archives() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pause.tar"), b"").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let host = Arc::new(MockHost::new("lokube"));
        let cache = KubeadmImageCache::new(host.clone(), dir.path().to_path_buf());
        cache.load_cached_images().await.unwrap();

        let commands = host.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("sudo docker load -i "));
        assert!(commands[0].contains("pause.tar"));
    }
}
