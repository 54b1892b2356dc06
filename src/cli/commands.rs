//! Command implementations for the CLI
//!
//! Commands return results; printing and process exit are handled by the
//! caller. Scale commands rewrite the cluster file on success so it keeps
//! describing the actual fleet.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::cluster::hosts::host_of;
use crate::cluster::{load_cluster_file, Cluster, ClusterError, Host, Role};
use crate::runtime::{new_runtime, RuntimeError};
use crate::ssh::{Executor, SshExecutor};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Cluster file error: {0}")]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

pub type CommandResult<T> = Result<T, CommandError>;

fn executor(cluster: &Cluster) -> Arc<dyn Executor> {
    Arc::new(SshExecutor::new(cluster.spec.ssh.clone()))
}

fn save_cluster_file(path: &Path, cluster: &Cluster) -> CommandResult<()> {
    let yaml = serde_yaml::to_string(cluster).map_err(ClusterError::from)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

fn make_hosts(addresses: &[String], role: Role) -> Vec<Host> {
    addresses
        .iter()
        .map(|addr| Host {
            address: addr.clone(),
            roles: vec![role],
            env: HashMap::new(),
        })
        .collect()
}

/// Bootstrap the full declared cluster: init on master0, then join every
/// remaining master and worker.
pub async fn init(cluster_file: &Path) -> CommandResult<()> {
    let cluster = load_cluster_file(cluster_file)?;
    cluster.validate()?;
    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;

    runtime.init().await?;
    let extra_masters: Vec<Host> = cluster.masters().into_iter().skip(1).collect();
    runtime.scale_up(extra_masters, cluster.nodes()).await?;
    Ok(())
}

/// Join new hosts and persist the grown host list back to the cluster file.
pub async fn add(
    cluster_file: &Path,
    masters: &[String],
    nodes: &[String],
) -> CommandResult<()> {
    if masters.is_empty() && nodes.is_empty() {
        return Err(CommandError::Invalid(
            "nothing to add; pass --masters and/or --nodes".to_string(),
        ));
    }
    let mut cluster = load_cluster_file(cluster_file)?;

    let new_masters = make_hosts(masters, Role::Master);
    let new_nodes = make_hosts(nodes, Role::Node);
    for host in new_masters.iter().chain(new_nodes.iter()) {
        if cluster.host_by_address(&host.address).is_some() {
            return Err(CommandError::Invalid(format!(
                "host {} is already part of the cluster",
                host.address
            )));
        }
    }

    cluster.spec.hosts.extend(new_masters.iter().cloned());
    cluster.spec.hosts.extend(new_nodes.iter().cloned());
    cluster.validate()?;

    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;
    runtime.scale_up(new_masters, new_nodes).await?;
    save_cluster_file(cluster_file, &cluster)?;
    Ok(())
}

/// Remove hosts and persist the shrunk host list back to the cluster file.
pub async fn delete(
    cluster_file: &Path,
    masters: &[String],
    nodes: &[String],
) -> CommandResult<()> {
    if masters.is_empty() && nodes.is_empty() {
        return Err(CommandError::Invalid(
            "nothing to delete; pass --masters and/or --nodes".to_string(),
        ));
    }
    let mut cluster = load_cluster_file(cluster_file)?;
    let master0 = cluster.master0()?;
    let mut removed_ips: Vec<String> =
        masters.iter().chain(nodes.iter()).map(|a| host_of(a)).collect();
    removed_ips.sort();
    removed_ips.dedup();
    if removed_ips.contains(&master0.ip()) {
        return Err(CommandError::Invalid(format!(
            "cannot remove {}: the first master anchors cluster secrets",
            master0.address
        )));
    }

    let mut removed_masters = Vec::new();
    let mut removed_nodes = Vec::new();
    for host in &cluster.spec.hosts {
        if !removed_ips.contains(&host.ip()) {
            continue;
        }
        if host.has_role(Role::Master) {
            removed_masters.push(host.clone());
        } else {
            removed_nodes.push(host.clone());
        }
    }
    if removed_masters.len() + removed_nodes.len() < removed_ips.len() {
        return Err(CommandError::Invalid(
            "some addresses are not part of the cluster".to_string(),
        ));
    }

    cluster
        .spec
        .hosts
        .retain(|h| !removed_ips.contains(&h.ip()));
    cluster.validate()?;

    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;
    runtime.scale_down(removed_masters, removed_nodes).await?;
    save_cluster_file(cluster_file, &cluster)?;
    Ok(())
}

/// Tear down every host and delete local cluster state.
pub async fn reset(cluster_file: &Path) -> CommandResult<()> {
    let cluster = load_cluster_file(cluster_file)?;
    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;
    runtime.reset().await?;
    Ok(())
}

/// Reachability of one declared host.
#[derive(Debug, Clone)]
pub struct HostStatus {
    pub address: String,
    pub roles: Vec<Role>,
    pub reachable: bool,
}

/// Ping every declared host.
pub async fn status(cluster_file: &Path) -> CommandResult<Vec<HostStatus>> {
    let cluster = load_cluster_file(cluster_file)?;
    let execer = executor(&cluster);

    let mut statuses = Vec::with_capacity(cluster.spec.hosts.len());
    for host in &cluster.spec.hosts {
        let reachable = execer.ping(&host.address).await.is_ok();
        statuses.push(HostStatus {
            address: host.address.clone(),
            roles: host.roles.clone(),
            reachable,
        });
    }
    Ok(statuses)
}

/// Render the control-plane config the runtime would apply.
pub async fn config(cluster_file: &Path) -> CommandResult<String> {
    let cluster = load_cluster_file(cluster_file)?;
    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;
    Ok(runtime.raw_config().await?)
}

/// Upgrade the control plane to a new version.
pub async fn upgrade(cluster_file: &Path, version: &str) -> CommandResult<()> {
    let cluster = load_cluster_file(cluster_file)?;
    let runtime = new_runtime(cluster.clone(), executor(&cluster))?;
    runtime.upgrade(version).await?;
    Ok(())
}
