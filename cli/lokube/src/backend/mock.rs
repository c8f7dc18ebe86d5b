//! Recording mock backend for testing.
//!
//! Every collaborator call and every host command is recorded in order so
//! tests can assert on the exact choreography of a start run. Failures are
//! injected by call name, by command substring, or as a number of initial
//! failed attempts for the retried steps.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use lokube_profile::{KubernetesConfig, MachineConfig};
use tracing::debug;

use super::{Backend, Bootstrapper, Host, HostProvisioner, ImageCache, ServiceStatus};

/// Address reported by mock hosts.
pub const MOCK_IP: &str = "192.168.99.100";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared recording and failure-injection state.
#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    cluster_configs: Mutex<Vec<KubernetesConfig>>,
    failing_calls: Mutex<Vec<String>>,
    failing_commands: Mutex<Vec<String>>,
    existing_machine: AtomicBool,
    host_start_failures: AtomicU32,
    kubelet_failures: AtomicU32,
    api_server_failures: AtomicU32,
}

impl MockState {
    /// Record a call; fail if it was configured to fail.
    fn call(&self, name: &str, detail: &str) -> Result<()> {
        let entry = if detail.is_empty() {
            name.to_string()
        } else {
            format!("{} {}", name, detail)
        };
        debug!(call = %entry, "[MOCK] call");
        lock(&self.calls).push(entry);

        if lock(&self.failing_calls).iter().any(|c| c == name) {
            bail!("[MOCK] {} configured to fail", name);
        }
        Ok(())
    }

    /// Consume one injected failure from a counter.
    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Mock machine with a recording command channel.
pub struct MockHost {
    name: String,
    state: Arc<MockState>,
}

impl MockHost {
    /// Standalone host with its own recorder.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(MockState::default()),
        }
    }

    /// Fail every command containing `pattern`.
    pub fn failing_command(self, pattern: &str) -> Self {
        lock(&self.state.failing_commands).push(pattern.to_string());
        self
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }
}

#[async_trait]
impl Host for MockHost {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ip(&self) -> Result<String> {
        self.state.call("ip", "")?;
        Ok(MOCK_IP.to_string())
    }

    async fn url(&self) -> Result<String> {
        self.state.call("url", "")?;
        Ok(format!("tcp://{}:2376", MOCK_IP))
    }

    async fn run_command(&self, command: &str) -> Result<String> {
        lock(&self.state.commands).push(command.to_string());

        if lock(&self.state.failing_commands)
            .iter()
            .any(|p| command.contains(p.as_str()))
        {
            bail!("[MOCK] command failed: {}", command);
        }
        Ok(String::new())
    }
}

struct MockProvisioner {
    state: Arc<MockState>,
}

#[async_trait]
impl HostProvisioner for MockProvisioner {
    async fn exists(&self, machine: &str) -> Result<bool> {
        self.state.call("exists", machine)?;
        Ok(self.state.existing_machine.load(Ordering::SeqCst))
    }

    async fn start_host(&self, machine: &str, config: &MachineConfig) -> Result<Arc<dyn Host>> {
        self.state.call("start_host", &config.vm_driver)?;
        if MockState::take_failure(&self.state.host_start_failures) {
            bail!("[MOCK] host {} failed to start", machine);
        }

        Ok(Arc::new(MockHost {
            name: machine.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockBootstrapper {
    state: Arc<MockState>,
}

impl MockBootstrapper {
    fn record(&self, name: &str, config: &KubernetesConfig) -> Result<()> {
        lock(&self.state.cluster_configs).push(config.clone());
        self.state.call(name, &config.kubernetes_version)
    }
}

#[async_trait]
impl Bootstrapper for MockBootstrapper {
    async fn update_cluster(&self, config: &KubernetesConfig) -> Result<()> {
        self.record("update_cluster", config)
    }

    async fn setup_certs(&self, config: &KubernetesConfig) -> Result<()> {
        self.record("setup_certs", config)
    }

    async fn start_cluster(&self, config: &KubernetesConfig) -> Result<()> {
        self.record("start_cluster", config)
    }

    async fn restart_cluster(&self, config: &KubernetesConfig) -> Result<()> {
        self.record("restart_cluster", config)
    }

    async fn kubelet_status(&self) -> Result<ServiceStatus> {
        self.state.call("kubelet_status", "")?;
        if MockState::take_failure(&self.state.kubelet_failures) {
            return Ok(ServiceStatus::Stopped);
        }
        Ok(ServiceStatus::Running)
    }

    async fn api_server_status(&self, ip: IpAddr, port: u16) -> Result<ServiceStatus> {
        self.state
            .call("api_server_status", &format!("{}:{}", ip, port))?;
        if MockState::take_failure(&self.state.api_server_failures) {
            bail!("[MOCK] connection refused");
        }
        Ok(ServiceStatus::Running)
    }
}

struct MockImageCache {
    state: Arc<MockState>,
}

#[async_trait]
impl ImageCache for MockImageCache {
    async fn cache_images(&self, kubernetes_version: &str, bootstrapper: &str) -> Result<()> {
        self.state.call(
            "cache_images",
            &format!("{} {}", kubernetes_version, bootstrapper),
        )
    }

    async fn load_cached_images(&self) -> Result<()> {
        self.state.call("load_cached_images", "")
    }
}

/// Mock backend producing recording collaborators.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report the machine as already created.
    pub fn with_existing_machine(self) -> Self {
        self.state.existing_machine.store(true, Ordering::SeqCst);
        self
    }

    /// Fail the first `n` host starts.
    pub fn failing_host_starts(self, n: u32) -> Self {
        self.state.host_start_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Report the kubelet stopped for the first `n` checks.
    pub fn unhealthy_kubelet_checks(self, n: u32) -> Self {
        self.state.kubelet_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail the first `n` API server probes.
    pub fn unhealthy_api_server_checks(self, n: u32) -> Self {
        self.state.api_server_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Fail every call with this name (e.g. `"setup_certs"`).
    pub fn failing_call(self, name: &str) -> Self {
        lock(&self.state.failing_calls).push(name.to_string());
        self
    }

    /// Fail every host command containing `pattern`.
    pub fn failing_command(self, pattern: &str) -> Self {
        lock(&self.state.failing_commands).push(pattern.to_string());
        self
    }

    /// Collaborator calls so far, in order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state.calls).clone()
    }

    /// Host commands so far, in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state.commands).clone()
    }

    /// Number of recorded calls with this name.
    pub fn call_count(&self, name: &str) -> usize {
        lock(&self.state.calls)
            .iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .count()
    }

    /// Cluster config passed to the most recent bootstrapper call.
    pub fn last_cluster_config(&self) -> Option<KubernetesConfig> {
        lock(&self.state.cluster_configs).last().cloned()
    }
}

impl Backend for MockBackend {
    fn provisioner(&self, driver: &str) -> Result<Arc<dyn HostProvisioner>> {
        self.state.call("provisioner", driver)?;
        Ok(Arc::new(MockProvisioner {
            state: Arc::clone(&self.state),
        }))
    }

    fn bootstrapper(&self, name: &str, _host: Arc<dyn Host>) -> Result<Arc<dyn Bootstrapper>> {
        self.state.call("bootstrapper", name)?;
        Ok(Arc::new(MockBootstrapper {
            state: Arc::clone(&self.state),
        }))
    }

    fn image_cache(&self) -> Arc<dyn ImageCache> {
        Arc::new(MockImageCache {
            state: Arc::clone(&self.state),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_host_failures_are_consumed() {
        let backend = MockBackend::new().failing_host_starts(1);
        let provisioner = backend.provisioner("virtualbox").unwrap();
        let config = MachineConfig::default();

        assert!(provisioner.start_host("lokube", &config).await.is_err());
        assert!(provisioner.start_host("lokube", &config).await.is_ok());
        assert_eq!(backend.call_count("start_host"), 2);
    }

    #[tokio::test]
    async fn test_failing_call() {
        let backend = MockBackend::new().failing_call("provisioner");
        assert!(backend.provisioner("kvm2").is_err());
        assert_eq!(backend.calls(), vec!["provisioner kvm2"]);
    }
}
