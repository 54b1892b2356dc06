//! Cluster lifecycle runtimes
//!
//! A [`Runtime`] drives one cluster through its lifecycle: init, scale up,
//! scale down, reset, upgrade. Two interchangeable implementations exist -
//! a kubeadm-style runtime and a k3s-style runtime - selected once from the
//! cluster's declared distribution and never branched on afterward.

pub mod config;
pub mod k3s;
pub mod kubeadm;
pub mod secrets;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::cluster::{Cluster, ClusterError, Distribution, Host};
use crate::pipeline::PhaseError;
use crate::ssh::{ExecError, Executor};

pub use config::ConfigError;
pub use k3s::K3sRuntime;
pub use kubeadm::KubeadmRuntime;

/// Errors from lifecycle operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A strict per-host phase aborted; carries the phase name and cause.
    #[error("{0}")]
    Pipeline(Box<PhaseError<RuntimeError>>),

    /// First error observed among parallel per-host tasks.
    #[error("task for host {host} failed: {source}")]
    FanOut {
        host: String,
        #[source]
        source: Box<RuntimeError>,
    },

    #[error("background task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl From<PhaseError<RuntimeError>> for RuntimeError {
    fn from(e: PhaseError<RuntimeError>) -> Self {
        RuntimeError::Pipeline(Box::new(e))
    }
}

/// The orchestration surface of one control-plane implementation.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Bootstrap master0 and produce the first converged single-master state.
    async fn init(&self) -> Result<(), RuntimeError>;

    /// Join new masters (sequentially) and new workers into the cluster.
    async fn scale_up(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError>;

    /// Remove masters and workers; removal is best-effort, reset always runs.
    async fn scale_down(&self, masters: Vec<Host>, nodes: Vec<Host>) -> Result<(), RuntimeError>;

    /// Fleet-wide teardown: nodes first, masters second, tolerating
    /// individual host failures.
    async fn reset(&self) -> Result<(), RuntimeError>;

    /// Upgrade the control plane to a new version.
    async fn upgrade(&self, version: &str) -> Result<(), RuntimeError>;

    /// Render the init config document without applying it.
    async fn raw_config(&self) -> Result<String, RuntimeError>;
}

/// Select the runtime for a cluster by its declared distribution.
pub fn new_runtime(
    cluster: Cluster,
    execer: Arc<dyn Executor>,
) -> Result<Box<dyn Runtime>, RuntimeError> {
    cluster.validate()?;
    match cluster.spec.distribution {
        Distribution::Kubeadm => Ok(Box::new(KubeadmRuntime::new(cluster, execer))),
        Distribution::K3s => Ok(Box::new(K3sRuntime::new(cluster, execer))),
    }
}

/// Fan one independent task out per host and wait for all of them.
///
/// Every task is attempted even when an earlier one fails; the first error
/// is returned with its host attached, later errors are logged and dropped.
/// Each task receives a child of `cancel` and checks it on entry, so a
/// caller that wants siblings stopped can cancel the parent token; by
/// default the token is never cancelled and siblings run to completion.
pub async fn fan_out<F, Fut>(
    hosts: &[String],
    cancel: &CancellationToken,
    f: F,
) -> Result<(), RuntimeError>
where
    F: Fn(String, CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), RuntimeError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for host in hosts {
        let token = cancel.child_token();
        let fut = f(host.clone(), token.clone());
        let host = host.clone();
        set.spawn(async move {
            if token.is_cancelled() {
                return (host, Ok(()));
            }
            (host, fut.await)
        });
    }

    let mut first: Option<RuntimeError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((host, Err(e))) => {
                error!("task for host {} failed: {}", host, e);
                if first.is_none() {
                    first = Some(RuntimeError::FanOut {
                        host,
                        source: Box::new(e),
                    });
                }
            }
            Err(join_err) => {
                if first.is_none() {
                    first = Some(join_err.into());
                }
            }
        }
    }
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Addresses of a host batch, in declaration order.
pub fn addresses(hosts: &[Host]) -> Vec<String> {
    hosts.iter().map(|h| h.address.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fan_out_attempts_every_host() {
        let attempted = Arc::new(AtomicUsize::new(0));
        let hosts: Vec<String> = (1..=4).map(|i| format!("10.0.0.{}", i)).collect();
        let cancel = CancellationToken::new();

        let err = fan_out(&hosts, &cancel, |host, _token| {
            let attempted = attempted.clone();
            async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                if host == "10.0.0.2" {
                    Err(RuntimeError::Other("induced".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();

        assert_eq!(attempted.load(Ordering::SeqCst), 4);
        match err {
            RuntimeError::FanOut { host, .. } => assert_eq!(host, "10.0.0.2"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_honors_cancellation() {
        let attempted = Arc::new(AtomicUsize::new(0));
        let hosts = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let cancel = CancellationToken::new();
        cancel.cancel();

        fan_out(&hosts, &cancel, |_host, _token| {
            let attempted = attempted.clone();
            async move {
                attempted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(attempted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fan_out_empty_hosts() {
        let cancel = CancellationToken::new();
        fan_out(&[], &cancel, |_h, _t| async { Ok(()) })
            .await
            .unwrap();
    }
}
