//! kubeadm-based control-plane runtime
//!
//! Drives the cluster lifecycle with stock `kubeadm` on every host: init on
//! master0, config-file joins for additional masters and workers, drain and
//! reset on the way out. Masters join sequentially (etcd membership changes
//! must not race), workers join and leave concurrently. All cluster secrets
//! are anchored at master0 and cached locally, so every later join reuses
//! the same token and certificate key.

pub mod config;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::hosts::host_of;
use crate::cluster::{Cluster, Host, DEFAULT_APISERVER_DOMAIN};
use crate::ipvs::VipDistributor;
use crate::paths::ClusterPaths;
use crate::pipeline::Phase;
use crate::remotectl::{CertSpec, RemoteCtl, ServiceAction};
use crate::runtime::secrets::{create_certificate_key, load_or_create, Token};
use crate::runtime::{addresses, fan_out, Runtime, RuntimeError};
use crate::ssh::{prefix_env, Executor};

use config::{
    build_document, cert_sans, cri_facts, init_mode, join_master_mode, join_node_mode,
    KubeadmDocument,
};

/// Admin kubeconfig as kubeadm writes it on every master.
const REMOTE_ADMIN_CONF: &str = "/etc/kubernetes/admin.conf";
const KUBELET_SERVICE: &str = "kubelet";
const INIT_CONFIG_FILE: &str = "kubeadm-init.yaml";

#[derive(Clone)]
pub struct KubeadmRuntime {
    cluster: Arc<Cluster>,
    execer: Arc<dyn Executor>,
    remote: RemoteCtl,
    paths: ClusterPaths,
    vip: VipDistributor,
    cancel: CancellationToken,
    token_cache: Arc<Mutex<Option<Token>>>,
}

impl KubeadmRuntime {
    pub fn new(cluster: Cluster, execer: Arc<dyn Executor>) -> Self {
        let paths = ClusterPaths::new(&cluster.metadata.name);
        Self::with_paths(cluster, execer, paths)
    }

    /// Same as [`KubeadmRuntime::new`] with an explicit data root.
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
            token_cache: Arc::new(Mutex::new(None)),
        }
    }

    fn certificate_key(&self) -> Result<String, RuntimeError> {
        Ok(load_or_create(
            &self.paths.certificate_key_file(),
            create_certificate_key,
        )?)
    }

    fn init_config_path(&self) -> String {
        self.paths
            .configs_path()
            .join(INIT_CONFIG_FILE)
            .display()
            .to_string()
    }

    /// The join token for this cluster, fetched from master0 once and then
    /// served from the local cache until it nears expiry.
    async fn join_token(&self) -> Result<Token, RuntimeError> {
        let mut cache = self.token_cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if !token.needs_refresh() {
                return Ok(token.clone());
            }
        }
        if let Ok(raw) = tokio::fs::read_to_string(self.paths.token_file()).await {
            if let Ok(token) = serde_json::from_str::<Token>(&raw) {
                if !token.needs_refresh() {
                    *cache = Some(token.clone());
                    return Ok(token);
                }
            }
        }

        let master0 = self.cluster.master0()?;
        let key = self.certificate_key()?;
        let raw = self
            .remote
            .token(&master0.address, &self.init_config_path(), &key)
            .await?;
        let token: Token = serde_json::from_str(&raw)?;
        tokio::fs::create_dir_all(self.paths.etc_path()).await?;
        tokio::fs::write(self.paths.token_file(), serde_json::to_vec(&token)?).await?;
        *cache = Some(token.clone());
        Ok(token)
    }

    /// Write a config document locally and ship it to the host at the same
    /// path, returning that path.
    async fn stage(
        &self,
        host: &str,
        file_name: &str,
        content: &str,
    ) -> Result<String, RuntimeError> {
        let local = self.paths.configs_path().join(file_name);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, content).await?;
        let remote = local.display().to_string();
        self.execer.upload(host, &local, &remote).await?;
        Ok(remote)
    }

    /// Probe CRI facts from a host and fold them into a document chain.
    async fn probed_document(
        &self,
        host: &str,
        extra: Vec<crate::runtime::config::Override<KubeadmDocument>>,
    ) -> Result<KubeadmDocument, RuntimeError> {
        let socket = self.remote.cri_socket(host).await?;
        let driver = self.remote.cgroup_driver(host).await?;
        let mut chain = extra;
        chain.push(cri_facts(socket, driver));
        Ok(build_document(&self.cluster, chain)?)
    }

    /// Issue the node certificate a kubelet needs before it can join.
    async fn issue_cert(
        &self,
        host: &str,
        ip: &str,
        doc: &KubeadmDocument,
    ) -> Result<(), RuntimeError> {
        let name = self.remote.hostname(host).await?;
        self.remote
            .cert(
                host,
                &CertSpec {
                    node_ip: Some(ip.to_string()),
                    node_name: Some(name),
                    service_cidr: Some(doc.service_cidr().to_string()),
                    dns_domain: Some(doc.dns_domain().to_string()),
                    alt_names: doc.cluster.api_server.cert_sans.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn prepare_master0(&self, master0: &Host) -> Result<(), RuntimeError> {
        let ip = master0.ip();
        self.remote
            .hosts_add(&master0.address, &ip, DEFAULT_APISERVER_DOMAIN)
            .await?;
        let key = self.certificate_key()?;
        let doc = self
            .probed_document(
                &master0.address,
                vec![cert_sans(&self.cluster), init_mode(&self.cluster, key)],
            )
            .await?;
        self.issue_cert(&master0.address, &ip, &doc).await?;
        self.stage(&master0.address, INIT_CONFIG_FILE, &doc.render_init()?)
            .await?;
        Ok(())
    }

    async fn run_kubeadm_init(&self, master0: &Host) -> Result<(), RuntimeError> {
        self.remote
            .initsystem(&master0.address, ServiceAction::Enable, KUBELET_SERVICE)
            .await?;
        let cmd = prefix_env(
            &master0.env,
            &format!(
                "kubeadm init --config {} --skip-certificate-key-print --skip-token-print",
                self.init_config_path()
            ),
        );
        self.execer
            .run(&master0.address, std::slice::from_ref(&cmd))
            .await?;
        Ok(())
    }

    async fn pull_admin_config(&self, master0: &Host) -> Result<(), RuntimeError> {
        tokio::fs::create_dir_all(self.paths.etc_path()).await?;
        self.execer
            .download(&master0.address, REMOTE_ADMIN_CONF, &self.paths.admin_file())
            .await?;
        Ok(())
    }

    /// Ship the admin kubeconfig to one host, pulling it from master0 first
    /// when the local copy is missing.
    async fn send_admin_config(&self, addr: &str) -> Result<(), RuntimeError> {
        if !self.paths.admin_file().exists() {
            let master0 = self.cluster.master0()?;
            self.pull_admin_config(&master0).await?;
        }
        self.execer
            .upload(addr, &self.paths.admin_file(), REMOTE_ADMIN_CONF)
            .await?;
        Ok(())
    }

    /// Push the admin kubeconfig to every target concurrently, so the whole
    /// fleet holds the same cluster credentials after a membership change.
    async fn propagate_admin_config(&self, targets: &[String]) -> Result<(), RuntimeError> {
        if targets.is_empty() {
            return Ok(());
        }
        info!("propagating admin credentials to {} host(s)", targets.len());
        fan_out(targets, &self.cancel, |addr, _token| {
            let this = self.clone();
            async move { this.send_admin_config(&addr).await }
        })
        .await
    }

    /// Join one additional control-plane member. Discovery goes through
    /// master0 directly; once joined, the new master resolves the stable
    /// apiserver domain to itself.
    async fn join_master(&self, master: &Host) -> Result<(), RuntimeError> {
        let addr = master.address.clone();
        let ip = master.ip();
        let master0_ip = self.cluster.master0()?.ip();
        let token = self.join_token().await?;

        let doc = self
            .probed_document(
                &addr,
                vec![
                    cert_sans(&self.cluster),
                    join_master_mode(&self.cluster, ip.clone(), token),
                ],
            )
            .await?;
        let file = format!("kubeadm-join-master-{}.yaml", ip);
        let config_path = {
            self.remote
                .hosts_add(&addr, &master0_ip, DEFAULT_APISERVER_DOMAIN)
                .await?;
            self.issue_cert(&addr, &ip, &doc).await?;
            self.stage(&addr, &file, &doc.render_join_master()?).await?
        };

        Phase::new(format!("join master {}", ip))
            .step(async {
                // Joining control-plane members start from master0's
                // credentials.
                self.send_admin_config(&addr).await?;
                Ok::<_, RuntimeError>(())
            })
            .step(async {
                self.remote
                    .initsystem(&addr, ServiceAction::Enable, KUBELET_SERVICE)
                    .await?;
                Ok(())
            })
            .step(async {
                let cmd = prefix_env(&master.env, &format!("kubeadm join --config {}", config_path));
                self.execer.run(&addr, std::slice::from_ref(&cmd)).await?;
                Ok(())
            })
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

    /// Join one worker. The worker's own HA rule goes in first so the VIP
    /// it discovers through is already answering.
    async fn join_node(
        &self,
        addr: &str,
        masters: &[Host],
        token: Token,
    ) -> Result<(), RuntimeError> {
        let ip = host_of(addr);
        self.remote
            .hosts_add(addr, &self.cluster.vip(), DEFAULT_APISERVER_DOMAIN)
            .await?;
        self.vip.install_on(addr, masters).await?;

        let doc = self
            .probed_document(addr, vec![join_node_mode(&self.cluster, ip.clone(), token)])
            .await?;
        self.issue_cert(addr, &ip, &doc).await?;
        let file = format!("kubeadm-join-node-{}.yaml", ip);
        let config_path = self.stage(addr, &file, &doc.render_join_node()?).await?;

        self.remote
            .initsystem(addr, ServiceAction::Enable, KUBELET_SERVICE)
            .await?;
        let env = self
            .cluster
            .host_by_address(addr)
            .map(|h| h.env.clone())
            .unwrap_or_default();
        let cmd = prefix_env(&env, &format!("kubeadm join --config {}", config_path));
        self.execer.run(addr, std::slice::from_ref(&cmd)).await?;
        info!("node {} joined", ip);
        Ok(())
    }

    /// Remove a host from the API (best effort) and wipe its kubeadm state.
    async fn remove_host(&self, addr: &str, is_node: bool) -> Result<(), RuntimeError> {
        let master0 = self.cluster.master0()?;
        match self.remote.hostname(addr).await {
            Ok(name) => {
                let delete = format!(
                    "kubectl --kubeconfig {} delete node {}",
                    REMOTE_ADMIN_CONF, name
                );
                if let Err(e) = self
                    .execer
                    .run(&master0.address, std::slice::from_ref(&delete))
                    .await
                {
                    warn!("could not delete node object for {}: {}", addr, e);
                }
            }
            Err(e) => warn!("skipping api removal for unreachable {}: {}", addr, e),
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
        let reset = "kubeadm reset -f --cleanup-tmp-dir".to_string();
        self.execer.run(addr, std::slice::from_ref(&reset)).await?;
        Ok(())
    }

    /// Drain, upgrade and uncordon one already-joined host.
    async fn upgrade_host(&self, addr: &str, version: &str, first: bool) -> Result<(), RuntimeError> {
        let master0 = self.cluster.master0()?;
        let name = self.remote.hostname(addr).await?;

        let drain = format!(
            "kubectl --kubeconfig {} drain {} --ignore-daemonsets --delete-emptydir-data",
            REMOTE_ADMIN_CONF, name
        );
        self.execer
            .run(&master0.address, std::slice::from_ref(&drain))
            .await?;

        let upgrade = if first {
            format!("kubeadm upgrade apply {} --yes", version)
        } else {
            "kubeadm upgrade node".to_string()
        };
        self.execer.run(addr, std::slice::from_ref(&upgrade)).await?;
        self.remote
            .initsystem(addr, ServiceAction::Restart, KUBELET_SERVICE)
            .await?;

        let uncordon = format!(
            "kubectl --kubeconfig {} uncordon {}",
            REMOTE_ADMIN_CONF, name
        );
        self.execer
            .run(&master0.address, std::slice::from_ref(&uncordon))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Runtime for KubeadmRuntime {
    async fn init(&self) -> Result<(), RuntimeError> {
        let master0 = self.cluster.master0()?;
        info!("initializing control plane on {}", master0.address);
        Phase::new("init master0")
            .step(async { self.prepare_master0(&master0).await })
            .step(async { self.run_kubeadm_init(&master0).await })
            .step(async { self.pull_admin_config(&master0).await })
            .step(async {
                self.propagate_admin_config(&addresses(&self.cluster.nodes()))
                    .await
            })
            .run()
            .await?;
        info!("control plane is up on {}", master0.address);
        Ok(())
    }

    async fn scale_up(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError> {
        for master in &masters {
            self.join_master(master).await?;
        }

        if !nodes.is_empty() {
            let token = self.join_token().await?;
            let master_set = self.cluster.masters();
            let addrs = addresses(&nodes);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                let token = token.clone();
                let master_set = master_set.clone();
                async move { this.join_node(&addr, &master_set, token).await }
            })
            .await?;
        }

        // A grown master set invalidates every worker's rule set and the
        // credentials the already-joined workers hold.
        if !masters.is_empty() {
            self.vip
                .sync(&self.cluster.nodes(), &self.cluster.masters(), &self.cancel)
                .await?;
            self.propagate_admin_config(&addresses(&self.cluster.nodes()))
                .await?;
        }
        Ok(())
    }

    async fn scale_down(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError> {
        // Workers go first so no kubelet is left discovering through a
        // master that is about to disappear.
        for (batch, is_node) in [(nodes, true), (masters.clone(), false)] {
            if batch.is_empty() {
                continue;
            }
            let addrs = addresses(&batch);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                async move { this.remove_host(&addr, is_node).await }
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
        // Teardown tolerates dead hosts; each failure is logged and the
        // sweep continues.
        for (batch, is_node) in [(self.cluster.nodes(), true), (self.cluster.masters(), false)] {
            let addrs = addresses(&batch);
            fan_out(&addrs, &self.cancel, |addr, _token| {
                let this = self.clone();
                async move {
                    if is_node {
                        if let Err(e) = this.vip.clean_on(&addr).await {
                            warn!("could not clean vip rule on {}: {}", addr, e);
                        }
                    }
                    if let Err(e) = this
                        .remote
                        .hosts_delete(&addr, DEFAULT_APISERVER_DOMAIN)
                        .await
                    {
                        warn!("could not clean hosts entry on {}: {}", addr, e);
                    }
                    let reset = "kubeadm reset -f --cleanup-tmp-dir".to_string();
                    if let Err(e) = this.execer.run(&addr, std::slice::from_ref(&reset)).await {
                        warn!("reset failed on {}: {}", addr, e);
                    }
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
        let master0 = self.cluster.master0()?;
        info!("upgrading control plane to {}", version);
        self.upgrade_host(&master0.address, version, true).await?;
        for host in self
            .cluster
            .masters()
            .iter()
            .skip(1)
            .chain(self.cluster.nodes().iter())
        {
            self.upgrade_host(&host.address, version, false).await?;
        }
        Ok(())
    }

    async fn raw_config(&self) -> Result<String, RuntimeError> {
        let doc = build_document(
            &self.cluster,
            vec![
                cert_sans(&self.cluster),
                init_mode(&self.cluster, String::new()),
            ],
        )?;
        Ok(doc.render_init()?)
    }
}
