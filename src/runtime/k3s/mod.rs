//! k3s-based control-plane runtime
//!
//! Same orchestration shape as the kubeadm runtime, different mechanics:
//! each host gets a rendered `/etc/rancher/k3s/config.yaml` plus the shared
//! cluster token file, then its init-system service is enabled and started.
//! Servers run the `k3s` unit, workers run `k3s-agent`. The embedded etcd
//! is bootstrapped on master0 with `cluster-init` and every later master
//! joins through master0's supervisor port.

pub mod config;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::hosts::host_of;
use crate::cluster::{Cluster, Host, DEFAULT_APISERVER_DOMAIN};
use crate::ipvs::VipDistributor;
use crate::paths::ClusterPaths;
use crate::pipeline::Phase;
use crate::remotectl::{RemoteCtl, ServiceAction};
use crate::runtime::secrets::{load_or_create, random_hex};
use crate::runtime::{addresses, fan_out, Runtime, RuntimeError};
use crate::ssh::Executor;

use config::{build_config, init_mode, join_master_mode, join_node_mode, CONFIG_PATH, TOKEN_PATH};

/// Admin kubeconfig as k3s writes it on every server.
const REMOTE_ADMIN_CONF: &str = "/etc/rancher/k3s/k3s.yaml";
const SERVER_SERVICE: &str = "k3s";
const AGENT_SERVICE: &str = "k3s-agent";

#[derive(Clone)]
pub struct K3sRuntime {
    cluster: Arc<Cluster>,
    execer: Arc<dyn Executor>,
    remote: RemoteCtl,
    paths: ClusterPaths,
    vip: VipDistributor,
    cancel: CancellationToken,
}

impl K3sRuntime {
    pub fn new(cluster: Cluster, execer: Arc<dyn Executor>) -> Self {
        let paths = ClusterPaths::new(&cluster.metadata.name);
        Self::with_paths(cluster, execer, paths)
    }

    pub fn with_paths(cluster: Cluster, execer: Arc<dyn Executor>, paths: ClusterPaths) -> Self {
        let remote = RemoteCtl::new(execer.clone(), &paths);
        let vip = VipDistributor::new(remote.clone(), cluster.vip_and_port(), &paths);
        Self {
            cluster: Arc::new(cluster),
            execer,
            remote,
            paths,
            vip,
            cancel: CancellationToken::new(),
        }
    }

    /// The shared secret every host authenticates with, generated once.
    fn cluster_token(&self) -> Result<String, RuntimeError> {
        Ok(load_or_create(
            &self.paths.etc_path().join("k3s-token"),
            || random_hex(16),
        )?)
    }

    /// Write a file locally under the cluster dir and ship it to a remote
    /// path on the host.
    async fn stage(
        &self,
        host: &str,
        local_name: &str,
        remote_path: &str,
        content: &str,
    ) -> Result<(), RuntimeError> {
        let local = self.paths.configs_path().join(local_name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, content).await?;
        self.execer.upload(host, &local, remote_path).await?;
        Ok(())
    }

    /// Token file plus rendered config file for one host.
    async fn stage_host(
        &self,
        host: &str,
        ip: &str,
        cfg: &config::K3sConfig,
    ) -> Result<(), RuntimeError> {
        self.stage(host, "k3s-token", TOKEN_PATH, &self.cluster_token()?)
            .await?;
        self.stage(host, &format!("k3s-{}.yaml", ip), CONFIG_PATH, &cfg.render()?)
            .await
    }

    async fn start_service(&self, host: &str, service: &str) -> Result<(), RuntimeError> {
        self.remote
            .initsystem(host, ServiceAction::Enable, service)
            .await?;
        self.remote
            .initsystem(host, ServiceAction::Start, service)
            .await?;
        Ok(())
    }

    async fn join_master(&self, master: &Host) -> Result<(), RuntimeError> {
        let addr = master.address.clone();
        let ip = master.ip();
        let master0_ip = self.cluster.master0()?.ip();
        let cfg = build_config(
            &self.cluster,
            vec![join_master_mode(&self.cluster, ip.clone())],
        )?;

        Phase::new(format!("join master {}", ip))
            .step(async {
                self.remote
                    .hosts_add(&addr, &master0_ip, DEFAULT_APISERVER_DOMAIN)
                    .await?;
                Ok(())
            })
            .step(async { self.stage_host(&addr, &ip, &cfg).await })
            .step(async { self.start_service(&addr, SERVER_SERVICE).await })
            .step(async {
                self.remote
                    .hosts_add(&addr, &ip, DEFAULT_APISERVER_DOMAIN)
                    .await?;
                Ok(())
            })
            .run()
            .await?;
        info!("master {} joined", ip);
        Ok(())
    }

    async fn join_node(&self, addr: &str, masters: &[Host]) -> Result<(), RuntimeError> {
        let ip = host_of(addr);
        self.remote
            .hosts_add(addr, &self.cluster.vip(), DEFAULT_APISERVER_DOMAIN)
            .await?;
        self.vip.install_on(addr, masters).await?;

        let cfg = build_config(
            &self.cluster,
            vec![join_node_mode(&self.cluster, ip.clone())],
        )?;
        self.stage_host(addr, &ip, &cfg).await?;
        self.start_service(addr, AGENT_SERVICE).await?;
        info!("node {} joined", ip);
        Ok(())
    }

    /// Best-effort wipe of one host's k3s state.
    async fn wipe_host(&self, addr: &str, is_node: bool) {
        let service = if is_node { AGENT_SERVICE } else { SERVER_SERVICE };
        if let Err(e) = self.remote.initsystem(addr, ServiceAction::Stop, service).await {
            warn!("could not stop {} on {}: {}", service, addr, e);
        }
        if is_node {
            if let Err(e) = self.vip.clean_on(addr).await {
                warn!("could not clean vip rule on {}: {}", addr, e);
            }
        }
        if let Err(e) = self
            .remote
            .hosts_delete(addr, DEFAULT_APISERVER_DOMAIN)
            .await
        {
            warn!("could not clean hosts entry on {}: {}", addr, e);
        }
        let wipe = "rm -rf /etc/rancher/k3s /var/lib/rancher/k3s".to_string();
        if let Err(e) = self.execer.run(addr, std::slice::from_ref(&wipe)).await {
            warn!("could not wipe k3s state on {}: {}", addr, e);
        }
    }
}

#[async_trait]
impl Runtime for K3sRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        let master0 = self.cluster.master0()?;
        let ip = master0.ip();
        info!("initializing k3s server on {}", master0.address);
        let cfg = build_config(&self.cluster, vec![init_mode(&self.cluster)])?;

        Phase::new("init master0")
            .step(async {
                self.remote
                    .hosts_add(&master0.address, &ip, DEFAULT_APISERVER_DOMAIN)
                    .await?;
                Ok(())
            })
            .step(async { self.stage_host(&master0.address, &ip, &cfg).await })
            .step(async { self.start_service(&master0.address, SERVER_SERVICE).await })
            .step(async {
                tokio::fs::create_dir_all(self.paths.etc_path()).await?;
                self.execer
                    .download(&master0.address, REMOTE_ADMIN_CONF, &self.paths.admin_file())
                    .await?;
                Ok(())
            })
            .run()
            .await?;
        info!("k3s server is up on {}", master0.address);
        Ok(())
    }

    async fn scale_up(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError> {
        for master in &masters {
            self.join_master(master).await?;
        }

        if !nodes.is_empty() {
            let master_set = self.cluster.masters();
            let addrs = addresses(&nodes);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                let master_set = master_set.clone();
                async move { this.join_node(&addr, &master_set).await }
            })
            .await?;
        }

        if !masters.is_empty() {
            self.vip
                .sync(&self.cluster.nodes(), &self.cluster.masters(), &self.cancel)
                .await?;
        }
        Ok(())
    }

    async fn scale_down(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError> {
        let master0 = self.cluster.master0()?;
        for (batch, is_node) in [(nodes, true), (masters.clone(), false)] {
            if batch.is_empty() {
                continue;
            }
            let addrs = addresses(&batch);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                let master0_addr = master0.address.clone();
                async move {
                    match this.remote.hostname(&addr).await {
                        Ok(name) => {
                            let delete = format!(
                                "kubectl --kubeconfig {} delete node {}",
                                REMOTE_ADMIN_CONF, name
                            );
                            if let Err(e) = this
                                .execer
                                .run(&master0_addr, std::slice::from_ref(&delete))
                                .await
                            {
                                warn!("could not delete node object for {}: {}", addr, e);
                            }
                        }
                        Err(e) => warn!("skipping api removal for unreachable {}: {}", addr, e),
                    }
                    this.wipe_host(&addr, is_node).await;
                    Ok(())
                }
            })
            .await?;
        }

        if !masters.is_empty() {
            self.vip
                .sync(&self.cluster.nodes(), &self.cluster.masters(), &self.cancel)
                .await?;
        }
        Ok(())
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        for (batch, is_node) in [(self.cluster.nodes(), true), (self.cluster.masters(), false)] {
            let addrs = addresses(&batch);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                async move {
                    this.wipe_host(&addr, is_node).await;
                    Ok(())
                }
            })
            .await?;
        }

        match tokio::fs::remove_dir_all(self.paths.root()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn upgrade(&self, version: &str) -> Result<(), RuntimeError> {
        // k3s upgrades by swapping the binary under the running unit; there
        // is no drain/apply cycle to drive from here, so the operation is
        // accepted and left to the operator.
        warn!(
            "in-place upgrade to {} is not driven for k3s; replace the k3s binary and restart the service on each host",
            version
        );
        Ok(())
    }

    async fn raw_config(&self) -> Result<String, RuntimeError> {
        let cfg = build_config(&self.cluster, vec![init_mode(&self.cluster)])?;
        Ok(cfg.render()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::ExecError;
    use std::path::Path;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        commands: StdMutex<Vec<(String, String)>>,
    }

    impl Recorder {
        fn commands(&self) -> Vec<(String, String)> {
            self.commands.lock().unwrap().clone()
        }
        fn record(&self, host: &str, cmd: &str) {
            self.commands
                .lock()
                .unwrap()
                .push((host.to_string(), cmd.to_string()));
        }
    }

    #[async_trait]
    impl Executor for Recorder {
        async fn ping(&self, _host: &str) -> Result<(), ExecError> {
            Ok(())
        }
        async fn output(&self, host: &str, cmd: &str) -> Result<Vec<u8>, ExecError> {
            self.record(host, cmd);
            Ok(b"node-1\n".to_vec())
        }
        async fn run(&self, host: &str, cmds: &[String]) -> Result<(), ExecError> {
            for cmd in cmds {
                self.record(host, cmd);
            }
            Ok(())
        }
        async fn upload(&self, host: &str, _src: &Path, dst: &str) -> Result<(), ExecError> {
            self.record(host, &format!("upload {}", dst));
            Ok(())
        }
        async fn download(&self, host: &str, src: &str, _dst: &Path) -> Result<(), ExecError> {
            self.record(host, &format!("download {}", src));
            Ok(())
        }
    }

    fn cluster() -> Cluster {
        let yaml = r#"
apiVersion: bosun.io/v1
kind: Cluster
metadata:
  name: default
spec:
  distribution: k3s
  hosts:
    - address: 10.0.0.1
      roles: [master]
    - address: 10.0.0.3
      roles: [node]
  image:
    - labring/k3s:v1.27.7-k3s1
"#;
        serde_yaml::from_str(yaml).unwrap()
    }

    fn runtime(tmp: &tempfile::TempDir) -> (K3sRuntime, Arc<Recorder>) {
        let execer = Arc::new(Recorder::default());
        let paths = ClusterPaths::with_root(tmp.path().join("default"));
        (
            K3sRuntime::with_paths(cluster(), execer.clone(), paths),
            execer,
        )
    }

    #[tokio::test]
    async fn test_init_stages_config_and_starts_server() {
        let tmp = tempfile::tempdir().unwrap();
        let (rt, execer) = runtime(&tmp);
        rt.init().await.unwrap();

        let cmds = execer.commands();
        assert!(cmds
            .iter()
            .any(|(_, c)| c == "upload /etc/rancher/k3s/config.yaml"));
        assert!(cmds
            .iter()
            .any(|(_, c)| c == "upload /etc/rancher/k3s/cluster-token"));
        assert!(cmds.iter().any(|(_, c)| c.ends_with("initsystem start k3s")));
        assert!(cmds
            .iter()
            .any(|(_, c)| c == "download /etc/rancher/k3s/k3s.yaml"));
    }

    #[tokio::test]
    async fn test_worker_runs_agent_service() {
        let tmp = tempfile::tempdir().unwrap();
        let (rt, execer) = runtime(&tmp);
        let node = rt.cluster.nodes().remove(0);
        rt.scale_up(vec![], vec![node]).await.unwrap();

        let on_node: Vec<String> = execer
            .commands()
            .into_iter()
            .filter(|(host, _)| host == "10.0.0.3")
            .map(|(_, c)| c)
            .collect();
        assert!(on_node.iter().any(|c| c.ends_with("initsystem start k3s-agent")));
        assert!(on_node.iter().any(|c| c.contains("ipvs --vs 10.103.97.2:6443")));
        assert!(!on_node.iter().any(|c| c.ends_with("initsystem start k3s")));
    }

    #[tokio::test]
    async fn test_upgrade_is_accepted_without_touching_hosts() {
        let tmp = tempfile::tempdir().unwrap();
        let (rt, execer) = runtime(&tmp);
        rt.upgrade("v1.28.0").await.unwrap();
        assert!(execer.commands().is_empty());
    }
}
