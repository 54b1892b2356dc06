//! k3s config file generation
//!
//! k3s takes one flat YAML config file per host, read from
//! `/etc/rancher/k3s/config.yaml` by both the server and the agent. The
//! same override-chain shape as the kubeadm documents applies; the
//! difference is that agent mode must end up with every server-only key
//! stripped, since the agent refuses to start on unknown keys.

use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, DEFAULT_APISERVER_PORT};
use crate::runtime::config::{apply_user_overrides, build, ConfigError, Override};

pub const CONFIG_PATH: &str = "/etc/rancher/k3s/config.yaml";
pub const TOKEN_PATH: &str = "/etc/rancher/k3s/cluster-token";

const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/22";
const DEFAULT_CLUSTER_DNS: &str = "10.96.0.10";
const DEFAULT_DATA_DIR: &str = "/var/lib/rancher/k3s";

fn is_false(b: &bool) -> bool {
    !*b
}

/// One host's k3s config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct K3sConfig {
    /// Bootstrap a new embedded-etcd cluster. Set only on master0.
    #[serde(default, skip_serializing_if = "is_false")]
    pub cluster_init: bool,

    /// Supervisor URL to join through. Empty on master0.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_file: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_ip: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls_san: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_cidr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_dns: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub data_dir: String,

    /// Packaged components to leave out (servicelb conflicts with the
    /// virtual-IP load balancer).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<String>,
}

impl K3sConfig {
    pub fn defaults() -> Self {
        Self {
            token_file: TOKEN_PATH.to_string(),
            service_cidr: DEFAULT_SERVICE_CIDR.to_string(),
            cluster_dns: DEFAULT_CLUSTER_DNS.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            disable: vec!["servicelb".to_string()],
            ..Self::default()
        }
    }

    pub fn render(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Override: deep-merge the cluster file's user config.
pub fn user_overrides(cluster: &Cluster) -> Override<K3sConfig> {
    let overrides = cluster.spec.config.clone();
    Box::new(move |cfg| match overrides {
        Some(value) => apply_user_overrides(cfg, &value),
        None => Ok(cfg),
    })
}

/// Override: server fields for master0, bootstrapping a new cluster.
pub fn init_mode(cluster: &Cluster) -> Override<K3sConfig> {
    let master0_ip = cluster.master0().map(|m| m.ip());
    let sans = server_sans(cluster);
    Box::new(move |mut cfg| {
        let ip = master0_ip.map_err(|e| ConfigError::Invalid(e.to_string()))?;
        cfg.cluster_init = true;
        cfg.server = String::new();
        cfg.node_ip = ip;
        cfg.tls_san = sans;
        Ok(cfg)
    })
}

/// Override: server fields for an additional master, joining through
/// master0's supervisor port.
pub fn join_master_mode(cluster: &Cluster, master_ip: String) -> Override<K3sConfig> {
    let master0_ip = cluster.master0().map(|m| m.ip());
    let sans = server_sans(cluster);
    Box::new(move |mut cfg| {
        let anchor = master0_ip.map_err(|e| ConfigError::Invalid(e.to_string()))?;
        cfg.cluster_init = false;
        cfg.server = format!("https://{}:{}", anchor, DEFAULT_APISERVER_PORT);
        cfg.node_ip = master_ip;
        cfg.tls_san = sans;
        Ok(cfg)
    })
}

/// Override: agent fields for a worker, joining through the virtual IP and
/// with every server-only key stripped.
pub fn join_node_mode(cluster: &Cluster, node_ip: String) -> Override<K3sConfig> {
    let vip = cluster.vip();
    Box::new(move |mut cfg| {
        cfg.cluster_init = false;
        cfg.server = format!("https://{}:{}", vip, DEFAULT_APISERVER_PORT);
        cfg.node_ip = node_ip;
        cfg.tls_san = Vec::new();
        cfg.service_cidr = String::new();
        cfg.cluster_dns = String::new();
        cfg.disable = Vec::new();
        Ok(cfg)
    })
}

fn server_sans(cluster: &Cluster) -> Vec<String> {
    let mut sans = vec![
        "127.0.0.1".to_string(),
        crate::cluster::DEFAULT_APISERVER_DOMAIN.to_string(),
        cluster.vip(),
    ];
    sans.extend(cluster.master_ips());
    sans.dedup();
    sans
}

/// Build one host's config through the standard chain.
pub fn build_config(
    cluster: &Cluster,
    overrides: Vec<Override<K3sConfig>>,
) -> Result<K3sConfig, ConfigError> {
    let mut chain: Vec<Override<K3sConfig>> = vec![user_overrides(cluster)];
    chain.extend(overrides);
    build(K3sConfig::defaults(), chain)
}
