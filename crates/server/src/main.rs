use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "testflow")]
#[command(about = "Test-management and workflow-orchestration service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "testflow.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "testflow=info,tower_http=debug".into()),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    tracing::info!("Starting testflow");

    let config = ServerConfig::load(&args.config)?;

    let addr = config.addr();
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
