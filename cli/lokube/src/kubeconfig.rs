//! kubeconfig merge and write.
//!
//! The cluster, user and context entries for a profile are upserted into an
//! existing kubeconfig. Other clusters, users and contexts are carried
//! through untouched.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::{
    AuthInfo, Cluster, Context as KubeContext, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};
use tracing::{debug, info};

/// Engine port in host URLs, replaced by the API server port.
const ENGINE_PORT_SUFFIX: &str = ":2376";

/// Parameters for pointing a kubeconfig at a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubeconfigSetup {
    pub cluster_name: String,
    pub server: String,
    pub client_certificate: PathBuf,
    pub client_key: PathBuf,
    pub certificate_authority: PathBuf,
    /// Leave `current-context` alone.
    pub keep_context: bool,
    /// Inline certificate data instead of referencing files.
    pub embed_certs: bool,
    pub kubeconfig_path: PathBuf,
}

/// API server URL derived from a host URL.
///
/// `tcp://192.168.99.100:2376` with port 8443 becomes
/// `https://192.168.99.100:8443`.
pub fn server_url(host_url: &str, api_server_port: u16) -> String {
    let url = match host_url.strip_prefix("tcp://") {
        Some(rest) => format!("https://{}", rest),
        None => host_url.to_string(),
    };
    match url.strip_suffix(ENGINE_PORT_SUFFIX) {
        Some(base) => format!("{}:{}", base, api_server_port),
        None => url,
    }
}

/// Kubeconfig entries addressed by name.
trait NamedEntry {
    type Value: Default;

    fn named(name: &str) -> Self;
    fn name(&self) -> &str;
    fn value_mut(&mut self) -> &mut Option<Self::Value>;
}

impl NamedEntry for NamedCluster {
    type Value = Cluster;

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cluster: None,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn value_mut(&mut self) -> &mut Option<Cluster> {
        &mut self.cluster
    }
}

impl NamedEntry for NamedAuthInfo {
    type Value = AuthInfo;

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            auth_info: None,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn value_mut(&mut self) -> &mut Option<AuthInfo> {
        &mut self.auth_info
    }
}

impl NamedEntry for NamedContext {
    type Value = KubeContext;

    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            context: None,
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn value_mut(&mut self) -> &mut Option<KubeContext> {
        &mut self.context
    }
}

fn upsert<'a, E: NamedEntry>(entries: &'a mut Vec<E>, name: &str) -> &'a mut E::Value {
    let idx = match entries.iter().position(|e| e.name() == name) {
        Some(idx) => idx,
        None => {
            entries.push(E::named(name));
            entries.len() - 1
        }
    };
    entries[idx].value_mut().get_or_insert_with(Default::default)
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn read_base64(path: &Path) -> Result<String> {
    let data = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(BASE64.encode(data))
}

fn empty_kubeconfig() -> Kubeconfig {
    Kubeconfig {
        api_version: Some("v1".to_string()),
        kind: Some("Config".to_string()),
        ..Default::default()
    }
}

fn load_kubeconfig(path: &Path) -> Result<Kubeconfig> {
    match fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(empty_kubeconfig()),
        Ok(contents) => Kubeconfig::from_yaml(&contents)
            .with_context(|| format!("failed to parse kubeconfig {:?}", path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(empty_kubeconfig()),
        Err(e) => Err(e).with_context(|| format!("failed to read kubeconfig {:?}", path)),
    }
}

fn apply(config: &mut Kubeconfig, setup: &KubeconfigSetup) -> Result<()> {
    let name = setup.cluster_name.as_str();

    let cluster = upsert(&mut config.clusters, name);
    cluster.server = Some(setup.server.clone());
    if setup.embed_certs {
        cluster.certificate_authority = None;
        cluster.certificate_authority_data = Some(read_base64(&setup.certificate_authority)?);
    } else {
        cluster.certificate_authority = Some(path_string(&setup.certificate_authority));
        cluster.certificate_authority_data = None;
    }

    let user = upsert(&mut config.auth_infos, name);
    if setup.embed_certs {
        user.client_certificate = None;
        user.client_key = None;
        user.client_certificate_data = Some(read_base64(&setup.client_certificate)?);
        user.client_key_data = Some(read_base64(&setup.client_key)?.into());
    } else {
        user.client_certificate = Some(path_string(&setup.client_certificate));
        user.client_key = Some(path_string(&setup.client_key));
        user.client_certificate_data = None;
        user.client_key_data = None;
    }

    let context = upsert(&mut config.contexts, name);
    context.cluster = name.to_string();
    context.user = name.to_string().into();

    if !setup.keep_context {
        config.current_context = Some(name.to_string());
    }
    Ok(())
}

/// Write a file atomically with mode 0600.
fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("failed to create {:?}", dir))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".kubeconfig.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("failed to create temp file in {:?}", dir))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {:?}", path))?;
    Ok(())
}

/// Merge the cluster's entries into the kubeconfig file.
pub fn setup_kubeconfig(setup: &KubeconfigSetup) -> Result<()> {
    let path = &setup.kubeconfig_path;
    let mut config = load_kubeconfig(path)?;
    apply(&mut config, setup)?;

    let yaml = serde_yaml::to_string(&config).context("failed to serialize kubeconfig")?;
    write_private(path, yaml.as_bytes())?;

    debug!(path = %path.display(), server = %setup.server, "Wrote kubeconfig");
    info!(
        cluster = %setup.cluster_name,
        keep_context = setup.keep_context,
        "Kubeconfig updated"
    );
    Ok(())
}
