//! bosun - declarative Kubernetes cluster lifecycle over SSH
//!
//! A cluster file declares the fleet (hosts, roles, SSH credentials, the
//! distribution to run); the runtimes converge the machines to it. All
//! remote work goes through an [`ssh::Executor`], with a local bypass when
//! the target is this machine, and host-side primitives are delegated to
//! the `bosunctl` helper shipped inside the cluster rootfs.

pub mod cli;
pub mod cluster;
pub mod ipvs;
pub mod paths;
pub mod pipeline;
pub mod remotectl;
pub mod runtime;
pub mod ssh;
