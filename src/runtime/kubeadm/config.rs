//! kubeadm config documents and their override chains
//!
//! One [`KubeadmDocument`] carries every kubeadm-family configuration for a
//! cluster. Per operation it is rebuilt from defaults through an ordered
//! override chain (defaults, user overrides, cert SANs, mode-specific
//! fields) and serialized as a multi-document YAML stream - the exact file
//! that is written locally and shipped to the target host.

use std::collections::BTreeMap;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::cluster::{Cluster, DEFAULT_APISERVER_DOMAIN, DEFAULT_APISERVER_PORT};
use crate::runtime::config::{
    apply_user_overrides, build, ensure_vip_outside_cidr, ConfigError, Override,
};
use crate::runtime::secrets::Token;

pub const KUBEADM_API_VERSION: &str = "kubeadm.k8s.io/v1beta3";
const KUBELET_API_VERSION: &str = "kubelet.config.k8s.io/v1beta1";
const KUBEPROXY_API_VERSION: &str = "kubeproxy.config.k8s.io/v1alpha1";

const DEFAULT_POD_SUBNET: &str = "100.64.0.0/10";
const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/22";
const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub advertise_address: String,
    pub bind_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cri_socket: String,
    /// `None` keeps kubeadm's default control-plane taint; an empty list
    /// suppresses it (single-host clusters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints: Option<Vec<Taint>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kubelet_extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitConfiguration {
    pub api_version: String,
    pub kind: String,
    pub local_api_endpoint: ApiEndpoint,
    #[serde(default)]
    pub node_registration: NodeRegistration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiServer {
    #[serde(default, rename = "certSANs", skip_serializing_if = "Vec::is_empty")]
    pub cert_sans: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_args: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    pub pod_subnet: String,
    pub service_subnet: String,
    pub dns_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfiguration {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kubernetes_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub control_plane_endpoint: String,
    #[serde(default)]
    pub api_server: ApiServer,
    pub networking: Networking,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapTokenDiscovery {
    pub token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_server_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca_cert_hashes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token: Option<BootstrapTokenDiscovery>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinControlPlane {
    pub local_api_endpoint: ApiEndpoint,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub certificate_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConfiguration {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub discovery: Discovery,
    /// Present only when joining as a control-plane member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<JoinControlPlane>,
    #[serde(default)]
    pub node_registration: NodeRegistration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeletConfiguration {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cgroup_driver: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeProxyIpvs {
    #[serde(default, rename = "excludeCIDRs", skip_serializing_if = "Vec::is_empty")]
    pub exclude_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeProxyConfiguration {
    pub api_version: String,
    pub kind: String,
    pub mode: String,
    #[serde(default)]
    pub ipvs: KubeProxyIpvs,
}

/// Every kubeadm-family document for one cluster, built fresh per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeadmDocument {
    pub init: InitConfiguration,
    pub cluster: ClusterConfiguration,
    pub join: JoinConfiguration,
    pub kubelet: KubeletConfiguration,
    pub kube_proxy: KubeProxyConfiguration,
}

impl KubeadmDocument {
    /// Defaulted base document for a cluster.
    pub fn defaults(cluster: &Cluster) -> Self {
        let version = cluster
            .rootfs_image()
            .and_then(|img| img.rsplit_once(':'))
            .map(|(_, tag)| tag.to_string())
            .unwrap_or_default();
        Self {
            init: InitConfiguration {
                api_version: KUBEADM_API_VERSION.to_string(),
                kind: "InitConfiguration".to_string(),
                local_api_endpoint: ApiEndpoint {
                    advertise_address: String::new(),
                    bind_port: DEFAULT_APISERVER_PORT,
                },
                node_registration: NodeRegistration::default(),
                certificate_key: String::new(),
            },
            cluster: ClusterConfiguration {
                api_version: KUBEADM_API_VERSION.to_string(),
                kind: "ClusterConfiguration".to_string(),
                kubernetes_version: version,
                control_plane_endpoint: String::new(),
                api_server: ApiServer::default(),
                networking: Networking {
                    pod_subnet: DEFAULT_POD_SUBNET.to_string(),
                    service_subnet: DEFAULT_SERVICE_SUBNET.to_string(),
                    dns_domain: DEFAULT_DNS_DOMAIN.to_string(),
                },
            },
            join: JoinConfiguration {
                api_version: KUBEADM_API_VERSION.to_string(),
                kind: "JoinConfiguration".to_string(),
                discovery: Discovery::default(),
                control_plane: None,
                node_registration: NodeRegistration::default(),
            },
            kubelet: KubeletConfiguration {
                api_version: KUBELET_API_VERSION.to_string(),
                kind: "KubeletConfiguration".to_string(),
                cgroup_driver: String::new(),
            },
            kube_proxy: KubeProxyConfiguration {
                api_version: KUBEPROXY_API_VERSION.to_string(),
                kind: "KubeProxyConfiguration".to_string(),
                mode: "ipvs".to_string(),
                ipvs: KubeProxyIpvs::default(),
            },
        }
    }

    pub fn service_cidr(&self) -> &str {
        &self.cluster.networking.service_subnet
    }

    pub fn dns_domain(&self) -> &str {
        &self.cluster.networking.dns_domain
    }

    /// The init document shipped to master0.
    pub fn render_init(&self) -> Result<String, ConfigError> {
        render(&[
            serde_yaml::to_string(&self.init)?,
            serde_yaml::to_string(&self.cluster)?,
            serde_yaml::to_string(&self.kubelet)?,
            serde_yaml::to_string(&self.kube_proxy)?,
        ])
    }

    /// The join document shipped to a new control-plane member.
    pub fn render_join_master(&self) -> Result<String, ConfigError> {
        render(&[
            serde_yaml::to_string(&self.join)?,
            serde_yaml::to_string(&self.kubelet)?,
        ])
    }

    /// The join document shipped to a new worker.
    pub fn render_join_node(&self) -> Result<String, ConfigError> {
        render(&[
            serde_yaml::to_string(&self.kubelet)?,
            serde_yaml::to_string(&self.join)?,
        ])
    }
}

fn render(docs: &[String]) -> Result<String, ConfigError> {
    Ok(docs
        .iter()
        .map(|d| d.trim_start_matches("---\n"))
        .collect::<Vec<_>>()
        .join("---\n"))
}

fn dedup_preserving(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

/// Override: deep-merge the cluster file's user config onto the document.
pub fn user_overrides(cluster: &Cluster) -> Override<KubeadmDocument> {
    let overrides = cluster.spec.config.clone();
    Box::new(move |doc| match overrides {
        Some(value) => apply_user_overrides(doc, &value),
        None => Ok(doc),
    })
}

/// Override: inject certificate SANs for every name the API server must
/// answer to: loopback, the stable domain, the VIP, and all master IPs.
pub fn cert_sans(cluster: &Cluster) -> Override<KubeadmDocument> {
    let mut sans = vec![
        "127.0.0.1".to_string(),
        DEFAULT_APISERVER_DOMAIN.to_string(),
        cluster.vip(),
    ];
    sans.extend(cluster.master_ips());
    Box::new(move |mut doc| {
        sans.extend(doc.cluster.api_server.cert_sans.clone());
        doc.cluster.api_server.cert_sans = dedup_preserving(sans);
        Ok(doc)
    })
}

/// Override: init-mode fields - advertise master0, pin the control-plane
/// endpoint to the stable domain, exclude the VIP from kube-proxy IPVS,
/// untaint single-host clusters, carry the certificate key.
pub fn init_mode(cluster: &Cluster, certificate_key: String) -> Override<KubeadmDocument> {
    let master0_ip = cluster.master0().map(|m| m.ip());
    let vip = cluster.vip();
    let single_host = cluster.all_addresses().len() == 1;
    Box::new(move |mut doc| {
        let master0_ip = master0_ip
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        doc.init.local_api_endpoint.advertise_address = master0_ip.clone();
        doc.init
            .node_registration
            .kubelet_extra_args
            .insert("node-ip".to_string(), master0_ip);
        doc.init.certificate_key = certificate_key;
        doc.cluster.control_plane_endpoint = format!(
            "{}:{}",
            DEFAULT_APISERVER_DOMAIN, doc.init.local_api_endpoint.bind_port
        );
        doc.kube_proxy.ipvs.exclude_cidrs = dedup_preserving({
            let mut cidrs = doc.kube_proxy.ipvs.exclude_cidrs.clone();
            cidrs.push(format!("{}/32", vip));
            cidrs
        });
        if single_host && doc.init.node_registration.taints.is_none() {
            doc.init.node_registration.taints = Some(Vec::new());
        }
        ensure_vip_outside_cidr(&vip, &doc.cluster.networking.pod_subnet, "podSubnet")?;
        ensure_vip_outside_cidr(&vip, &doc.cluster.networking.service_subnet, "serviceSubnet")?;
        Ok(doc)
    })
}

/// Override: join-as-master fields - advertise the new master, discover
/// through master0 directly (the token anchor), carry the join secrets.
pub fn join_master_mode(
    cluster: &Cluster,
    master_ip: String,
    token: Token,
) -> Override<KubeadmDocument> {
    let master0_ip = cluster.master0().map(|m| m.ip());
    Box::new(move |mut doc| {
        let master0_ip = master0_ip
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        doc.join.discovery.bootstrap_token = Some(BootstrapTokenDiscovery {
            token: token.join_token.clone(),
            api_server_endpoint: format!(
                "{}:{}",
                master0_ip, doc.init.local_api_endpoint.bind_port
            ),
            ca_cert_hashes: token.discovery_token_ca_cert_hash.clone(),
        });
        doc.join.control_plane = Some(JoinControlPlane {
            local_api_endpoint: ApiEndpoint {
                advertise_address: master_ip.clone(),
                bind_port: doc.init.local_api_endpoint.bind_port,
            },
            certificate_key: token.certificate_key.clone(),
        });
        doc.join
            .node_registration
            .kubelet_extra_args
            .insert("node-ip".to_string(), master_ip.clone());
        Ok(doc)
    })
}

/// Override: join-as-node fields - discover through the VIP so the worker
/// always reaches a live master, and strip every control-plane-only field
/// a server-mode document would have set.
pub fn join_node_mode(
    cluster: &Cluster,
    node_ip: String,
    token: Token,
) -> Override<KubeadmDocument> {
    let vip_and_port = cluster.vip_and_port();
    Box::new(move |mut doc| {
        doc.join.discovery.bootstrap_token = Some(BootstrapTokenDiscovery {
            token: token.join_token.clone(),
            api_server_endpoint: vip_and_port.clone(),
            ca_cert_hashes: token.discovery_token_ca_cert_hash.clone(),
        });
        doc.join.control_plane = None;
        doc.join
            .node_registration
            .kubelet_extra_args
            .insert("node-ip".to_string(), node_ip.clone());
        Ok(doc)
    })
}

/// Override: CRI facts probed from the target node itself.
pub fn cri_facts(cri_socket: String, cgroup_driver: String) -> Override<KubeadmDocument> {
    Box::new(move |mut doc| {
        let socket = if cri_socket.starts_with("unix://") {
            cri_socket.clone()
        } else {
            format!("unix://{}", cri_socket)
        };
        doc.init.node_registration.cri_socket = socket.clone();
        doc.join.node_registration.cri_socket = socket;
        doc.kubelet.cgroup_driver = cgroup_driver.clone();
        Ok(doc)
    })
}

/// Build the document for one operation through the standard chain.
pub fn build_document(
    cluster: &Cluster,
    overrides: Vec<Override<KubeadmDocument>>,
) -> Result<KubeadmDocument, ConfigError> {
    let mut chain: Vec<Override<KubeadmDocument>> = vec![user_overrides(cluster)];
    chain.extend(overrides);
    build(KubeadmDocument::defaults(cluster), chain)
}
