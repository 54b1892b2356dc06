//! Well-known local and remote paths derived from a cluster name
//!
//! Every generated artifact - admin credentials, staged init/join configs,
//! secrets, the shipped rootfs with the `bosunctl` helper - lives under a
//! single per-cluster directory so that reset can remove it wholesale.

use std::path::{Path, PathBuf};

use crate::cluster::hosts::is_unprivileged;

/// System-wide data root used when running as root.
const SYSTEM_DATA_ROOT: &str = "/var/lib/bosun";

/// Resolves every well-known path for one cluster.
///
/// The same layout is used locally and on every remote host, so a path
/// computed here can be shipped verbatim inside rendered commands.
#[derive(Debug, Clone)]
pub struct ClusterPaths {
    root: PathBuf,
}

impl ClusterPaths {
    pub fn new(cluster_name: &str) -> Self {
        let base = if is_unprivileged() {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".bosun")
        } else {
            PathBuf::from(SYSTEM_DATA_ROOT)
        };
        Self {
            root: base.join(cluster_name),
        }
    }

    /// Root with a fixed base, used by tests and remote rendering.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Staged init/join config documents.
    pub fn configs_path(&self) -> PathBuf {
        self.root.join("configs")
    }

    /// Secrets and other small state files (token, certificate key).
    pub fn etc_path(&self) -> PathBuf {
        self.root.join("etc")
    }

    /// Scratch space for per-node intermediate files.
    pub fn tmp_path(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// The admin kubeconfig pulled from master0.
    pub fn admin_file(&self) -> PathBuf {
        self.etc_path().join("admin.conf")
    }

    pub fn token_file(&self) -> PathBuf {
        self.etc_path().join("kubeadm-token.json")
    }

    pub fn certificate_key_file(&self) -> PathBuf {
        self.etc_path().join("certificate-key")
    }

    /// The unpacked rootfs image shipped to every host.
    pub fn rootfs_path(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// The remote control helper binary inside the rootfs.
    pub fn bosunctl_path(&self) -> PathBuf {
        self.rootfs_path().join("opt").join("bosunctl")
    }

    /// Static pod manifests directory on target hosts.
    pub fn manifests_path(&self) -> PathBuf {
        PathBuf::from("/etc/kubernetes/manifests")
    }

    /// Rendered `bosunctl` invocation prefix for remote commands.
    pub fn bosunctl(&self) -> String {
        self.bosunctl_path().display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_rooted_at_cluster_name() {
        let paths = ClusterPaths::with_root("/var/lib/bosun/default");
        assert_eq!(
            paths.configs_path(),
            PathBuf::from("/var/lib/bosun/default/configs")
        );
        assert_eq!(
            paths.admin_file(),
            PathBuf::from("/var/lib/bosun/default/etc/admin.conf")
        );
        assert_eq!(
            paths.bosunctl(),
            "/var/lib/bosun/default/rootfs/opt/bosunctl"
        );
    }

    #[test]
    fn test_secrets_live_under_etc() {
        let paths = ClusterPaths::with_root("/data/c1");
        assert!(paths.token_file().starts_with(paths.etc_path()));
        assert!(paths.certificate_key_file().starts_with(paths.etc_path()));
    }
}
