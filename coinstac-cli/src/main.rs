//! COINSTAC CLI
//!
//! Validates pipeline specifications, runs them on this machine (alone or
//! as a simulated federation) and pre-pulls their images.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "coinstac")]
#[command(about = "COINSTAC decentralized pipeline runner", long_about = None)]
struct Cli {
    /// Root of run input, output and scratch directories
    #[arg(long, env = "COINSTAC_OPERATING_DIR", default_value = "./coinstac-data")]
    operating_dir: PathBuf,

    /// Container CLI used to run docker computations
    #[arg(long, env = "COINSTAC_CONTAINER_BINARY", default_value = "podman")]
    container_binary: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinstac=info,coinstac_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config {
        operating_dir: cli.operating_dir,
        container_binary: cli.container_binary,
    };

    handle_command(cli.command, &config).await
}
