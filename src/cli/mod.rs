//! CLI for bosun
//!
//! kubectl-like subcommands over one cluster file:
//! - `bosun init` - bootstrap the declared cluster from scratch
//! - `bosun add` - join additional masters and workers
//! - `bosun delete` - remove masters and workers
//! - `bosun reset` - tear the whole cluster down
//! - `bosun status` - reachability of every declared host
//! - `bosun config` - print the generated control-plane config

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod display;

pub use commands::*;
pub use display::*;

#[derive(Parser, Debug)]
#[command(name = "bosun")]
#[command(about = "Declarative Kubernetes cluster lifecycle over SSH")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to the cluster file
    #[arg(short = 'f', long, global = true, default_value = "Clusterfile")]
    pub cluster_file: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap the cluster declared in the cluster file
    Init,

    /// Join additional hosts into a running cluster
    Add(ScaleArgs),

    /// Remove hosts from a running cluster
    Delete(ScaleArgs),

    /// Tear down every host and delete local cluster state
    Reset(ResetArgs),

    /// Show reachability of every declared host
    Status,

    /// Print the generated control-plane config without applying it
    Config,

    /// Upgrade the control plane to a new version
    Upgrade(UpgradeArgs),
}

#[derive(Parser, Debug)]
pub struct ScaleArgs {
    /// Master addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    pub masters: Vec<String>,

    /// Worker addresses, comma separated
    #[arg(long, value_delimiter = ',')]
    pub nodes: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ResetArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct UpgradeArgs {
    /// Target version, e.g. v1.28.0
    pub version: String,
}
