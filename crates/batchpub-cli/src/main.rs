//! batchpub - run one batch commit or installation sync from the shell
//!
//! ## Commands
//!
//! - `commit`: publish (or dry-run) a batch as a single commit
//! - `sync-installation`: bind a site to a GitHub App installation
//!
//! Configuration comes from the environment (or a `.env` file), exactly as
//! for `batchpubd`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use batchpub_core::{
    CommitRequest, InstallationSyncRequest, Runtime, ServiceConfig, METRICS,
};
use batchpub_state::{BatchId, FsBlobStore, SiteId};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "batchpub")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish staged site assets as one commit", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Commit every staged asset of a batch to the site's branch
    Commit {
        /// Batch to publish
        #[arg(value_parser = parse_batch_id)]
        batch_id: BatchId,

        /// Mint a token and release the batch without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Read staged blobs from this directory instead of the storage bucket
        #[arg(long)]
        blob_dir: Option<PathBuf>,
    },

    /// Point a site at a GitHub App installation
    SyncInstallation {
        #[arg(long, value_parser = parse_site_id)]
        site_id: SiteId,

        #[arg(long)]
        installation_id: u64,

        /// Repository as `owner/name`
        #[arg(long)]
        repo: String,

        #[arg(long, default_value = "main")]
        branch: String,

        #[arg(long)]
        app_slug: Option<String>,
    },
}

fn parse_batch_id(s: &str) -> Result<BatchId, String> {
    BatchId::parse(s).map_err(|e| format!("invalid batch id: {e}"))
}

fn parse_site_id(s: &str) -> Result<SiteId, String> {
    SiteId::parse(s).map_err(|e| format!("invalid site id: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    batchpub_core::init_tracing(cli.json, level);

    let config = ServiceConfig::from_env().context("Failed to load configuration")?;

    let result = match cli.command {
        Commands::Commit {
            batch_id,
            dry_run,
            blob_dir,
        } => cmd_commit(&config, batch_id, dry_run, blob_dir).await,
        Commands::SyncInstallation {
            site_id,
            installation_id,
            repo,
            branch,
            app_slug,
        } => {
            cmd_sync_installation(
                &config,
                InstallationSyncRequest {
                    site_id,
                    installation_id,
                    repo_full_name: repo,
                    default_branch: branch,
                    github_app_slug: app_slug,
                },
            )
            .await
        }
    };
    METRICS.flush();
    result
}

async fn cmd_commit(
    config: &ServiceConfig,
    batch_id: BatchId,
    dry_run: bool,
    blob_dir: Option<PathBuf>,
) -> Result<()> {
    let runtime = match blob_dir {
        Some(dir) => {
            info!(dir = %dir.display(), "reading blobs from directory");
            Runtime::from_config_with_blobs(config, Arc::new(FsBlobStore::new(dir)))
        }
        None => Runtime::from_config(config),
    }
    .context("Failed to build clients")?;

    match runtime
        .orchestrator
        .commit(CommitRequest { batch_id, dry_run })
        .await
    {
        Ok(receipt) => {
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        Err(err) => {
            if !err.is_conflict() && !err.is_not_found() {
                eprintln!("{}", serde_json::to_string_pretty(&err.detail())?);
            }
            Err(anyhow::Error::new(err).context(format!("Commit of batch {batch_id} failed")))
        }
    }
}

async fn cmd_sync_installation(
    config: &ServiceConfig,
    request: InstallationSyncRequest,
) -> Result<()> {
    let runtime = Runtime::from_config(config).context("Failed to build clients")?;
    let site_id = request.site_id;
    let expires_at = runtime
        .installations
        .sync(request)
        .await
        .with_context(|| format!("Installation sync for site {site_id} failed"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "ok": true,
            "expiresAt": expires_at.to_rfc3339(),
        }))?
    );
    Ok(())
}
