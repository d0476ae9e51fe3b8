use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::node::Node;

mod config;
mod constants;
mod node;

#[derive(Parser)]
struct Cli {
    /// Sets a custom config file
    #[arg(
        short,
        long,
        value_name = "FILE",
        default_value = constants::DEFAULT_CONFIG_FILE_PATH
    )]
    config: PathBuf,

    /// Enables verbose output on STDOUT
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cfg = Config::read(Some(cli.config))?;

    let mut node = Node::new(&cfg)?;
    node.run().await
}
