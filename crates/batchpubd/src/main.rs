use std::net::SocketAddr;

use anyhow::{Context, Result};
use batchpub_core::{init_tracing, Runtime, ServiceConfig, METRICS};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "batchpubd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batch commit orchestrator service", long_about = None)]
struct Args {
    /// Address to listen on (overrides BATCHPUB_BIND)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing(
        args.json,
        if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        },
    );

    let mut config = ServiceConfig::from_env().context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    let runtime = Runtime::from_config(&config).context("failed to build clients")?;

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    batchpubd::serve(listener, runtime, shutdown_signal())
        .await
        .context("server error")?;

    info!("batchpubd stopped");
    METRICS.flush();
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
