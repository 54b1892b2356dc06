//! HA virtual-IP distribution
//!
//! Keeps every worker's local load balancer pointed at the live master set.
//! Each worker runs an lvscare static pod that binds the virtual IP and
//! forwards to the current masters, with a liveness check against each
//! backend's health endpoint. The rule set is recomputed and pushed to the
//! full node set whenever a master is added or removed; a node's own rule
//! is cleaned only when that node is reset or removed. Re-installing an
//! unchanged rule set is a no-op from the caller's perspective.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cluster::{Host, DEFAULT_APISERVER_PORT};
use crate::paths::ClusterPaths;
use crate::remotectl::RemoteCtl;
use crate::runtime::{fan_out, RuntimeError};
use crate::ssh::ExecError;

/// Static pod name for the load balancer.
const LVSCARE_POD_NAME: &str = "kube-lvscare";
/// Default lvscare image when the cluster declares none.
const DEFAULT_LVSCARE_IMAGE: &str = "docker.io/labring/lvscare:latest";

/// Distributes the virtual-IP load-balancer rule across the fleet.
#[derive(Clone)]
pub struct VipDistributor {
    remote: RemoteCtl,
    vip_and_port: String,
    manifests_path: String,
    image: String,
}

impl VipDistributor {
    pub fn new(remote: RemoteCtl, vip_and_port: String, paths: &ClusterPaths) -> Self {
        Self {
            remote,
            vip_and_port,
            manifests_path: paths.manifests_path().display().to_string(),
            image: DEFAULT_LVSCARE_IMAGE.to_string(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Deduplicated `master:apiserver-port` real-server list.
    pub fn real_servers(masters: &[Host]) -> Vec<String> {
        let mut seen = HashSet::new();
        masters
            .iter()
            .map(|m| format!("{}:{}", m.ip(), DEFAULT_APISERVER_PORT))
            .filter(|rs| seen.insert(rs.clone()))
            .collect()
    }

    /// Install (or refresh) the rule and the lvscare static pod on one node.
    ///
    /// The run-once rule makes the virtual IP reachable immediately, which
    /// joining workers need before the kubelet picks up the static pod.
    pub async fn install_on(&self, node: &str, masters: &[Host]) -> Result<(), ExecError> {
        let rs = Self::real_servers(masters);
        self.remote
            .ipvs_install(node, &self.vip_and_port, &rs)
            .await?;
        self.remote
            .static_pod_lvscare(
                node,
                &self.manifests_path,
                LVSCARE_POD_NAME,
                &self.vip_and_port,
                &self.image,
                &rs,
                &[],
            )
            .await
    }

    /// Remove this node's rule. Run before the node itself is reset so no
    /// stale rule survives pointing at a control plane it can no longer
    /// route through.
    pub async fn clean_on(&self, node: &str) -> Result<(), ExecError> {
        self.remote.ipvs_clean(node, &self.vip_and_port).await
    }

    /// Push the current master set to every worker, one concurrent task per
    /// node. Run after any master-set change.
    pub async fn sync(
        &self,
        nodes: &[Host],
        masters: &[Host],
        cancel: &CancellationToken,
    ) -> Result<(), RuntimeError> {
        if nodes.is_empty() {
            return Ok(());
        }
        info!(
            "syncing vip {} rules to {} node(s), {} master(s)",
            self.vip_and_port,
            nodes.len(),
            masters.len()
        );
        let addrs: Vec<String> = nodes.iter().map(|n| n.address.clone()).collect();
        let masters = masters.to_vec();
        fan_out(&addrs, cancel, move |node, _token| {
            let this = self.clone();
            let masters = masters.clone();
            async move {
                this.install_on(&node, &masters).await?;
                Ok(())
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn host(addr: &str) -> Host {
        Host {
            address: addr.to_string(),
            roles: vec![crate::cluster::Role::Master],
            env: HashMap::new(),
        }
    }

    #[test]
    fn test_real_servers_use_apiserver_port() {
        let masters = vec![host("10.0.0.1"), host("10.0.0.2:2222")];
        assert_eq!(
            VipDistributor::real_servers(&masters),
            vec!["10.0.0.1:6443", "10.0.0.2:6443"]
        );
    }

    #[test]
    fn test_real_servers_deduplicate() {
        let masters = vec![host("10.0.0.1"), host("10.0.0.1:22")];
        assert_eq!(
            VipDistributor::real_servers(&masters),
            vec!["10.0.0.1:6443"]
        );
    }
}
