use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

mod api;
mod config;
mod websocket;

use config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "DAG workflow execution service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "conductor.toml", env = "CONDUCTOR_CONFIG")]
    config: PathBuf,

    /// Data directory for the run log
    #[arg(short, long, default_value = "./data", env = "CONDUCTOR_DATA_DIR")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Conductor");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    tracing::info!(
        max_concurrency = config.engine.max_concurrency,
        runtime = ?config.runtime.kind,
        "Engine configured"
    );

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, config).await?;

    Ok(())
}
