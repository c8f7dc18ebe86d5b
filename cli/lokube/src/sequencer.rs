//! The start sequence.
//!
//! Turns a profile's options into a running single-node cluster. Steps run
//! in a fixed order on one task. Each step is either fatal (the run stops
//! with a [`StartError`]) or advisory (logged, the run continues):
//!
//! | Step                                   | On error  |
//! |----------------------------------------|-----------|
//! | machine config validation              | fatal     |
//! | image pre-cache task                   | advisory  |
//! | provisioning client, existence check   | fatal     |
//! | previous profile load                  | advisory  |
//! | profile save (both)                    | advisory  |
//! | host start (retried)                   | fatal     |
//! | host IP                                | fatal     |
//! | crictl config write                    | advisory  |
//! | version guard                          | advisory  |
//! | bootstrapper, update, certs            | fatal     |
//! | host URL, kubeconfig                   | fatal     |
//! | runtime stop/restart                   | advisory  |
//! | cluster start or restart               | fatal     |
//! | kubelet and API server health          | fatal     |
//! | mount helper                           | fatal     |
//! | ownership fix-up (no-VM)               | fatal     |
//! | cached image reload                    | advisory  |
//!
//! Retries live only in the health poller; the sequence never repeats a
//! step itself.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use lokube_profile::{KubernetesConfig, MachineConfig, ProfileDocument, ProfileStore};
use lokube_retry::{retry, AttemptError, AttemptResult, ResultExt, RetryBudget};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, Bootstrapper, Host, ServiceStatus};
use crate::error::StartError;
use crate::kubeconfig::{server_url, setup_kubeconfig, KubeconfigSetup};
use crate::mount::{MountError, MountSpawner, MountString};
use crate::options::StartOptions;
use crate::ownership::chown_recursive;
use crate::paths::LokubeHome;
use crate::runtime::RuntimeSelector;
use crate::version_guard::select_version;

/// Host start: 5 attempts, 2s apart.
pub const HOST_START_BUDGET: RetryBudget = RetryBudget::new(5, Duration::from_secs(2));

/// Kubelet health: 20 attempts, 3s apart.
pub const KUBELET_BUDGET: RetryBudget = RetryBudget::new(20, Duration::from_secs(3));

/// API server health: 30 attempts, 10s apart.
pub const API_SERVER_BUDGET: RetryBudget = RetryBudget::new(30, Duration::from_secs(10));

pub const CLIENT_CERT_FILE: &str = "client.crt";
pub const CLIENT_KEY_FILE: &str = "client.key";
pub const CA_CERT_FILE: &str = "ca.crt";

/// How the bootstrapper brought the control plane up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    /// Fresh initialization.
    Start,
    /// Components of an existing control plane restarted.
    Restart,
}

impl fmt::Display for ClusterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("start"),
            Self::Restart => f.write_str("restart"),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub action: ClusterAction,
    pub kubernetes_version: String,
    pub kubeconfig: KubeconfigSetup,
    /// PID of the mount helper, when one was started.
    pub mount_pid: Option<u32>,
}

/// Drives one start run against a backend.
pub struct Sequencer {
    backend: Arc<dyn Backend>,
    home: LokubeHome,
    kubeconfig_path: PathBuf,
    mount_spawner: Option<MountSpawner>,
}

impl Sequencer {
    pub fn new(backend: Arc<dyn Backend>, home: LokubeHome, kubeconfig_path: PathBuf) -> Self {
        Self {
            backend,
            home,
            kubeconfig_path,
            mount_spawner: None,
        }
    }

    /// Use `spawner` for the mount helper instead of re-invoking this executable.
    pub fn with_mount_spawner(mut self, spawner: MountSpawner) -> Self {
        self.mount_spawner = Some(spawner);
        self
    }

    pub async fn run(&self, options: &StartOptions) -> Result<StartOutcome, StartError> {
        let machine = options.profile.as_str();
        let machine_config = options.machine_config()?;
        let requested_version = options.requested_version();

        info!(
            profile = %machine,
            driver = %machine_config.vm_driver,
            version = %requested_version,
            "Starting cluster"
        );

        let cache_task = options
            .cache_images
            .then(|| self.spawn_image_cache(requested_version, &options.bootstrapper));

        let provisioner = self
            .backend
            .provisioner(&machine_config.vm_driver)
            .map_err(|source| StartError::Provisioner {
                driver: machine_config.vm_driver.clone(),
                source,
            })?;
        let exists = provisioner
            .exists(machine)
            .await
            .map_err(|source| StartError::MachineExists {
                machine: machine.to_string(),
                source,
            })?;

        let store = self.home.profile_store(machine);
        let previous = load_previous(&store);
        save_profile(&store, &ProfileDocument::machine_only(machine_config.clone()));

        println!("Starting local Kubernetes {} cluster...", requested_version);
        println!("Starting VM...");
        let host = {
            let provisioner = &provisioner;
            let machine_config = &machine_config;
            retry(HOST_START_BUDGET, move || async move {
                provisioner
                    .start_host(machine, machine_config)
                    .await
                    .retriable()
            })
            .await
            .map_err(StartError::HostStart)?
        };

        println!("Getting VM IP address...");
        let ip = host.ip().await.map_err(StartError::HostIp)?;

        let selector = RuntimeSelector::new(&options.cluster.container_runtime);
        if let Err(e) = selector.write_crictl_config(host.as_ref()).await {
            error!(error = %e, "Error writing crictl config");
        }

        let selection = select_version(previous.as_ref(), requested_version);
        if let Some(blocked) = &selection.downgrade_blocked {
            println!(
                "Kubernetes version downgrade is not supported. Using version: {}",
                blocked.kept
            );
            println!(
                "To use {}, delete the existing {:?} profile and start again.",
                blocked.requested, machine
            );
        }

        let kubernetes_config = options.kubernetes_config(&selection.version, &ip);
        let bootstrapper = self
            .backend
            .bootstrapper(&options.bootstrapper, Arc::clone(&host))
            .map_err(|source| StartError::Bootstrapper {
                name: options.bootstrapper.clone(),
                source,
            })?;

        save_profile(
            &store,
            &ProfileDocument::complete(machine_config.clone(), kubernetes_config.clone()),
        );

        if let Some(task) = cache_task {
            wait_for_image_cache(task).await;
        }

        println!("Moving files into cluster...");
        bootstrapper
            .update_cluster(&kubernetes_config)
            .await
            .map_err(StartError::UpdateCluster)?;

        println!("Setting up certs...");
        bootstrapper
            .setup_certs(&kubernetes_config)
            .await
            .map_err(StartError::SetupCerts)?;

        println!("Connecting to cluster...");
        let host_url = host.url().await.map_err(StartError::HostUrl)?;

        println!("Setting up kubeconfig...");
        let kubeconfig = self.kubeconfig_setup(options, &host_url);
        setup_kubeconfig(&kubeconfig).map_err(StartError::Kubeconfig)?;

        if !machine_config.is_no_vm() {
            self.switch_runtime(&selector, host.as_ref()).await;
        }

        let action = self
            .start_components(&machine_config, exists, bootstrapper.as_ref(), &kubernetes_config)
            .await?;

        self.verify_health(bootstrapper.as_ref(), &kubernetes_config)
            .await?;

        let mount_pid = if options.mount {
            Some(self.spawn_mount(options)?)
        } else {
            None
        };

        if machine_config.is_no_vm() {
            self.no_vm_post_steps(options)?;
        }

        println!("Loading cached images from config file.");
        if let Err(e) = self.backend.image_cache().load_cached_images().await {
            warn!(error = %e, "Unable to load cached images");
            println!("Unable to load cached images from config file.");
        }

        info!(
            profile = %machine,
            action = %action,
            version = %selection.version,
            "Cluster started"
        );

        Ok(StartOutcome {
            action,
            kubernetes_version: selection.version,
            kubeconfig,
            mount_pid,
        })
    }

    fn spawn_image_cache(
        &self,
        version: &str,
        bootstrapper: &str,
    ) -> JoinHandle<anyhow::Result<()>> {
        let cache = self.backend.image_cache();
        let version = version.to_string();
        let bootstrapper = bootstrapper.to_string();

        tokio::spawn(async move { cache.cache_images(&version, &bootstrapper).await })
    }

    fn kubeconfig_setup(&self, options: &StartOptions, host_url: &str) -> KubeconfigSetup {
        KubeconfigSetup {
            cluster_name: options.profile.clone(),
            server: server_url(host_url, options.cluster.api_server_port),
            client_certificate: self.home.cert(CLIENT_CERT_FILE),
            client_key: self.home.cert(CLIENT_KEY_FILE),
            certificate_authority: self.home.cert(CA_CERT_FILE),
            keep_context: options.keep_context,
            embed_certs: options.embed_certs,
            kubeconfig_path: self.kubeconfig_path.clone(),
        }
    }

    /// Leave only the selected container runtime running.
    async fn switch_runtime(&self, selector: &RuntimeSelector, host: &dyn Host) {
        println!("Stopping extra container runtimes...");
        let failed = selector.stop_others(host).await;
        if !failed.is_empty() {
            debug!(failed = ?failed, "Some container runtimes did not stop");
        }

        if let Err(e) = selector.restart_selected(host).await {
            error!(error = %e, "Error restarting container runtime");
        }
    }

    /// Restart when the machine already existed. The no-VM driver always
    /// takes the restart path, even on a host that has never run a cluster,
    /// so a fresh `none` host is brought up through the restart phases rather
    /// than a full `kubeadm init`.
    async fn start_components(
        &self,
        machine_config: &MachineConfig,
        exists: bool,
        bootstrapper: &dyn Bootstrapper,
        config: &KubernetesConfig,
    ) -> Result<ClusterAction, StartError> {
        if exists || machine_config.is_no_vm() {
            println!("Machine exists, restarting cluster components...");
            bootstrapper
                .restart_cluster(config)
                .await
                .map_err(StartError::RestartCluster)?;
            Ok(ClusterAction::Restart)
        } else {
            println!("Starting cluster components...");
            bootstrapper
                .start_cluster(config)
                .await
                .map_err(StartError::StartCluster)?;
            Ok(ClusterAction::Start)
        }
    }

    async fn verify_health(
        &self,
        bootstrapper: &dyn Bootstrapper,
        config: &KubernetesConfig,
    ) -> Result<(), StartError> {
        println!("Verifying kubelet health ...");
        retry(KUBELET_BUDGET, move || async move {
            require_running("kubelet", bootstrapper.kubelet_status().await)
        })
        .await
        .map_err(StartError::KubeletHealth)?;

        let ip: IpAddr = config
            .node_ip
            .parse()
            .map_err(|source| StartError::InvalidNodeIp {
                ip: config.node_ip.clone(),
                source,
            })?;
        let port = config.node_port;

        println!("Verifying apiserver health ...");
        retry(API_SERVER_BUDGET, move || async move {
            require_running("apiserver", bootstrapper.api_server_status(ip, port).await)
        })
        .await
        .map_err(StartError::ApiServerHealth)?;

        Ok(())
    }

    fn spawn_mount(&self, options: &StartOptions) -> Result<u32, StartError> {
        let mount: MountString = options.mount_string.parse()?;
        println!("Setting up hostmount on {}...", mount);

        let spawner = match &self.mount_spawner {
            Some(spawner) => spawner.clone(),
            None => MountSpawner::current_exe(self.home.mount_pid_file(), options.verbosity)
                .map_err(|source| MountError::Launch {
                    program: PathBuf::from("lokube"),
                    source,
                })?,
        };

        Ok(spawner.spawn(&options.mount_string)?)
    }

    fn no_vm_post_steps(&self, options: &StartOptions) -> Result<(), StartError> {
        if options.none_driver_warning {
            println!();
            println!("===================");
            println!("WARNING: IT IS RECOMMENDED NOT TO RUN THE NONE DRIVER ON PERSONAL WORKSTATIONS");
            println!("\tThe 'none' driver will run an insecure kubernetes apiserver as root that may leave the host vulnerable to CSRF attacks");
            println!();
        }

        if !options.change_none_user {
            println!("When using the none driver, the kubectl config and credentials generated will be root owned and will appear in the root home directory.");
            println!("You will need to move the files to the appropriate location and then set the correct permissions.  An example of this is below:");
            println!();
            println!("\tsudo mv /root/.kube $HOME/.kube # this will write over any previous configuration");
            println!("\tsudo chown -R $USER $HOME/.kube");
            println!("\tsudo chgrp -R $USER $HOME/.kube");
            println!();
            println!("\tsudo mv /root/.lokube $HOME/.lokube # this will write over any previous configuration");
            println!("\tsudo chown -R $USER $HOME/.lokube");
            println!("\tsudo chgrp -R $USER $HOME/.lokube");
            println!();
            println!("This can also be done automatically by setting the env var CHANGE_LOKUBE_NONE_USER=true");
        }

        if let Some(owner) = options.none_owner() {
            let root = self.home.root();
            chown_recursive(root, owner).map_err(|source| StartError::Ownership {
                path: root.display().to_string(),
                source,
            })?;
        }

        Ok(())
    }
}

/// A health probe passes only when the component reports `Running`.
fn require_running(
    component: &str,
    status: anyhow::Result<ServiceStatus>,
) -> AttemptResult<(), anyhow::Error> {
    match status {
        Ok(status) if status.is_running() => Ok(()),
        Ok(status) => Err(AttemptError::Retriable(anyhow!(
            "{} status: {}",
            component,
            status
        ))),
        Err(e) => Err(AttemptError::Retriable(e)),
    }
}

fn load_previous(store: &ProfileStore) -> Option<ProfileDocument> {
    match store.load() {
        Ok(Some(doc)) => Some(doc),
        Ok(None) => {
            info!(path = %store.path().display(), "No previous profile found");
            None
        }
        Err(e) => {
            warn!(error = %e, "Error loading profile config");
            None
        }
    }
}

fn save_profile(store: &ProfileStore, doc: &ProfileDocument) {
    if let Err(e) = store.save(doc) {
        error!(error = %e, "Error saving profile cluster configuration");
    }
}

async fn wait_for_image_cache(task: JoinHandle<anyhow::Result<()>>) {
    println!("Waiting for image caching to complete...");
    match task.await {
        Ok(Ok(())) => debug!("Image cache task finished"),
        Ok(Err(e)) => error!(error = %e, "Error caching images"),
        Err(e) => error!(error = %e, "Error waiting for image cache task"),
    }
}
