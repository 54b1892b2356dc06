use std::io::{BufRead, Write};
use std::process;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use bosun::cli::{self, Cli, Commands};

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N]: ", prompt);
    if std::io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if std::io::stdin().lock().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let result = match args.command {
        Commands::Init => cli::init(&args.cluster_file).await,
        Commands::Add(scale) => cli::add(&args.cluster_file, &scale.masters, &scale.nodes).await,
        Commands::Delete(scale) => {
            cli::delete(&args.cluster_file, &scale.masters, &scale.nodes).await
        }
        Commands::Reset(reset) => {
            if !reset.force && !confirm("This wipes every host in the cluster. Continue?") {
                return;
            }
            cli::reset(&args.cluster_file).await
        }
        Commands::Status => match cli::status(&args.cluster_file).await {
            Ok(statuses) => {
                print!("{}", cli::format_status(&statuses));
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Config => match cli::config(&args.cluster_file).await {
            Ok(yaml) => {
                println!("{}", yaml);
                Ok(())
            }
            Err(e) => Err(e),
        },
        Commands::Upgrade(upgrade) => cli::upgrade(&args.cluster_file, &upgrade.version).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        process::exit(1);
    }
}
