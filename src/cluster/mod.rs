//! Cluster resource - the declarative description of a fleet of machines
//!
//! A Cluster is the single source of truth for membership. It lists hosts
//! with their roles, the SSH credentials used to reach them, the workload
//! images, and the virtual IP through which every node reaches the
//! control plane.

pub mod hosts;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use hosts::{dedup, host_of, is_local, is_unprivileged, normalize, split_host_port};

/// Default API server port.
pub const DEFAULT_APISERVER_PORT: u16 = 6443;
/// Default virtual IP when the cluster declares none.
pub const DEFAULT_VIP: &str = "10.103.97.2";
/// Stable domain that always resolves to the current control plane.
pub const DEFAULT_APISERVER_DOMAIN: &str = "apiserver.cluster.local";

/// Errors for loading and validating a cluster file
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to read cluster file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse cluster file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Cluster validation failed: {0}")]
    Invalid(String),
}

/// Role a host plays inside the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Node,
    Registry,
}

/// Which control-plane implementation drives this cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Kubeadm,
    K3s,
}

/// A machine in the cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Address in `ip[:port]` form; the port defaults per-cluster
    pub address: String,

    /// Roles this host carries
    pub roles: Vec<Role>,

    /// Per-host environment overrides applied to remote commands
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Host {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// The bare IP/hostname without the port.
    pub fn ip(&self) -> String {
        host_of(&self.address)
    }
}

/// SSH credential set shared by every host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Path to a private key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk: Option<String>,

    /// Passphrase for the private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pk_passwd: Option<String>,

    /// Default SSH port for hosts that declare none
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: default_user(),
            password: None,
            pk: None,
            pk_passwd: None,
            port: default_ssh_port(),
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    hosts::DEFAULT_SSH_PORT
}

/// Metadata for a Cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Unique name for this cluster
    pub name: String,
}

/// Cluster specification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// Control-plane implementation
    #[serde(default)]
    pub distribution: Distribution,

    /// Hosts in declaration order; the first master is master0
    pub hosts: Vec<Host>,

    /// Workload images; the first is the rootfs image supplying
    /// version and labels, the rest are patch/app images
    #[serde(default)]
    pub image: Vec<String>,

    /// SSH credentials
    #[serde(default)]
    pub ssh: SshConfig,

    /// Virtual IP fronting the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vip: Option<String>,

    /// User overrides deep-merged into generated control-plane config
    /// documents, after defaults and before computed fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_yaml::Value>,
}

/// A Cluster resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Kind is always "Cluster"
    pub kind: String,

    pub metadata: ClusterMetadata,

    pub spec: ClusterSpec,
}

impl Cluster {
    /// Name of the cluster.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// All hosts carrying the given role, in declaration order, deduplicated
    /// by normalized address.
    pub fn hosts_with_role(&self, role: Role) -> Vec<Host> {
        let mut seen = std::collections::HashSet::new();
        self.spec
            .hosts
            .iter()
            .filter(|h| h.has_role(role))
            .filter(|h| seen.insert(normalize(&h.address, self.spec.ssh.port)))
            .cloned()
            .collect()
    }

    pub fn masters(&self) -> Vec<Host> {
        self.hosts_with_role(Role::Master)
    }

    pub fn nodes(&self) -> Vec<Host> {
        self.hosts_with_role(Role::Node)
    }

    /// The first declared master. Immutable anchor for join tokens and
    /// cluster-wide secrets for the lifetime of the cluster.
    pub fn master0(&self) -> Result<Host, ClusterError> {
        self.masters()
            .into_iter()
            .next()
            .ok_or_else(|| ClusterError::Invalid("cluster has no master host".to_string()))
    }

    /// Bare IPs of all masters.
    pub fn master_ips(&self) -> Vec<String> {
        self.masters().iter().map(|h| h.ip()).collect()
    }

    /// All distinct host addresses.
    pub fn all_addresses(&self) -> Vec<String> {
        let addrs: Vec<String> = self.spec.hosts.iter().map(|h| h.address.clone()).collect();
        dedup(&addrs, self.spec.ssh.port)
    }

    /// The virtual IP, defaulted when the cluster file declares none.
    pub fn vip(&self) -> String {
        self.spec
            .vip
            .clone()
            .unwrap_or_else(|| DEFAULT_VIP.to_string())
    }

    /// `vip:port` form used by IPVS rules and join endpoints.
    pub fn vip_and_port(&self) -> String {
        format!("{}:{}", self.vip(), DEFAULT_APISERVER_PORT)
    }

    /// The rootfs image, carrying the control-plane version.
    pub fn rootfs_image(&self) -> Option<&str> {
        self.spec.image.first().map(|s| s.as_str())
    }

    /// Look up a host by its normalized address.
    pub fn host_by_address(&self, addr: &str) -> Option<&Host> {
        let want = normalize(addr, self.spec.ssh.port);
        self.spec
            .hosts
            .iter()
            .find(|h| normalize(&h.address, self.spec.ssh.port) == want)
    }

    /// Validate structural invariants before any operation runs.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.spec.hosts.is_empty() {
            return Err(ClusterError::Invalid("cluster has no hosts".to_string()));
        }
        self.master0()?;
        Ok(())
    }
}

/// Load and validate a cluster file from disk.
pub fn load_cluster_file(path: &Path) -> Result<Cluster, ClusterError> {
    let content = std::fs::read_to_string(path)?;
    let cluster: Cluster = serde_yaml::from_str(&content)?;
    cluster.validate()?;
    Ok(cluster)
}
