//! Remote control protocol client
//!
//! Renders fixed command templates for the `bosunctl` helper shipped inside
//! the rootfs on every host, and executes them through the [`Executor`].
//! Every command is prefixed with the resolved helper path for the cluster;
//! failures surface with the host and the literal command line attached.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::paths::ClusterPaths;
use crate::ssh::{ExecError, Executor};

/// Init-system service actions understood by `bosunctl initsystem`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Enable,
    Start,
    Stop,
    Restart,
    IsExists,
    IsEnabled,
    IsActive,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceAction::Enable => "enable",
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::IsExists => "is-exists",
            ServiceAction::IsEnabled => "is-enabled",
            ServiceAction::IsActive => "is-active",
        };
        f.write_str(s)
    }
}

/// Parameters for issuing a node certificate.
#[derive(Debug, Clone, Default)]
pub struct CertSpec {
    pub node_ip: Option<String>,
    pub node_name: Option<String>,
    pub service_cidr: Option<String>,
    pub dns_domain: Option<String>,
    pub alt_names: Vec<String>,
}

/// Templated client for the remote-side control utility.
#[derive(Clone)]
pub struct RemoteCtl {
    execer: Arc<dyn Executor>,
    ctl: String,
}

impl RemoteCtl {
    pub fn new(execer: Arc<dyn Executor>, paths: &ClusterPaths) -> Self {
        Self {
            execer,
            ctl: paths.bosunctl(),
        }
    }

    fn render(&self, args: &str) -> String {
        format!("{} {}", self.ctl, args)
    }

    async fn run(&self, host: &str, args: String) -> Result<(), ExecError> {
        let cmd = self.render(&args);
        debug!("remotectl on {}: {}", host, cmd);
        self.execer.run(host, std::slice::from_ref(&cmd)).await
    }

    async fn query(&self, host: &str, args: String, sep: &str) -> Result<String, ExecError> {
        let cmd = self.render(&args);
        debug!("remotectl on {}: {}", host, cmd);
        self.execer.output_to_string(host, &cmd, sep).await
    }

    /// Add a hosts-table entry mapping a domain to an IP.
    pub async fn hosts_add(&self, host: &str, ip: &str, domain: &str) -> Result<(), ExecError> {
        self.run(host, format!("hosts add --ip {} --domain {}", ip, domain))
            .await
    }

    /// Delete a hosts-table entry by domain.
    pub async fn hosts_delete(&self, host: &str, domain: &str) -> Result<(), ExecError> {
        self.run(host, format!("hosts delete --domain {}", domain))
            .await
    }

    /// Cluster-internal hostname of the target.
    pub async fn hostname(&self, host: &str) -> Result<String, ExecError> {
        let name = self.query(host, "hostname".to_string(), "").await?;
        Ok(name.trim().to_string())
    }

    /// Retrieve a join token document given a config path and certificate key.
    pub async fn token(
        &self,
        host: &str,
        config_path: &str,
        certificate_key: &str,
    ) -> Result<String, ExecError> {
        self.query(host, format!("token {} {}", config_path, certificate_key), "\n")
            .await
    }

    /// Container runtime cgroup driver, short form.
    pub async fn cgroup_driver(&self, host: &str) -> Result<String, ExecError> {
        self.query(host, "cri cgroup-driver --short".to_string(), "")
            .await
    }

    /// Container runtime socket path.
    pub async fn cri_socket(&self, host: &str) -> Result<String, ExecError> {
        self.query(host, "cri socket".to_string(), "").await
    }

    /// Install the IPVS virtual-server rule with the given real servers.
    pub async fn ipvs_install(
        &self,
        host: &str,
        vs: &str,
        rs: &[String],
    ) -> Result<(), ExecError> {
        let mut args = format!("ipvs --vs {}", vs);
        for r in rs {
            args.push_str(&format!(" --rs {}", r));
        }
        args.push_str(" --health-path /healthz --health-schem https --run-once");
        self.run(host, args).await
    }

    /// Clean the IPVS virtual-server rule from a node.
    pub async fn ipvs_clean(&self, host: &str, vs: &str) -> Result<(), ExecError> {
        self.run(host, format!("ipvs --vs {} -C", vs)).await
    }

    /// Install the static-pod manifest running the lvscare load balancer.
    pub async fn static_pod_lvscare(
        &self,
        host: &str,
        manifests_path: &str,
        name: &str,
        vip: &str,
        image: &str,
        masters: &[String],
        options: &[String],
    ) -> Result<(), ExecError> {
        let mut args = format!(
            "static-pod lvscare --path {} --name {} --vip {} --image {}",
            manifests_path, name, vip, image
        );
        for m in masters {
            args.push_str(&format!(" --masters {}", m));
        }
        for o in options {
            args.push_str(&format!(" --options {}", o));
        }
        self.run(host, args).await
    }

    /// Issue a node certificate.
    pub async fn cert(&self, host: &str, spec: &CertSpec) -> Result<(), ExecError> {
        let mut args = String::from("cert");
        if let Some(ip) = &spec.node_ip {
            args.push_str(&format!(" --node-ip {}", ip));
        }
        if let Some(name) = &spec.node_name {
            args.push_str(&format!(" --node-name {}", name));
        }
        if let Some(cidr) = &spec.service_cidr {
            args.push_str(&format!(" --service-cidr {}", cidr));
        }
        if let Some(domain) = &spec.dns_domain {
            args.push_str(&format!(" --dns-domain {}", domain));
        }
        for san in &spec.alt_names {
            args.push_str(&format!(" --alt-names {}", san));
        }
        self.run(host, args).await
    }

    /// Query or trigger init-system service state.
    pub async fn initsystem(
        &self,
        host: &str,
        action: ServiceAction,
        service: &str,
    ) -> Result<(), ExecError> {
        self.run(host, format!("initsystem {} {}", action, service))
            .await
    }
}
