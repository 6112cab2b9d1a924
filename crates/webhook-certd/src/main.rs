//! webhook-certd - admission webhook certificate rotation daemon
//!
//! Keeps a private CA, serving key and serving certificate on disk for each
//! configured webhook, and rotates them ahead of expiry.

mod config;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use webhook_certs::{DirectoryStore, RotationManager};

use crate::config::DaemonConfig;

#[derive(Parser)]
#[command(name = "webhook-certd")]
#[command(about = "Admission webhook certificate rotation daemon")]
#[command(version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run rotation managers for every configured webhook
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/webhook-certd/config.json")]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/webhook-certd/config.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format)?;

    match cli.command {
        Commands::Run { config } => run_daemon(config).await?,
        Commands::InitConfig { output } => init_config(&output)?,
    }

    Ok(())
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("webhook_certd=info,webhook_certs=info"))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
    Ok(())
}

async fn run_daemon(config_path: PathBuf) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting webhook-certd");

    let config = DaemonConfig::load(&config_path)?;
    info!(
        output_dir = %config.output_dir.display(),
        webhooks = config.webhooks.len(),
        cert_duration_secs = config.rotation.cert_duration_secs,
        "loaded config"
    );

    let store = DirectoryStore::new(&config.output_dir);
    let cancel = CancellationToken::new();
    let (errors_tx, mut errors_rx) = mpsc::unbounded_channel();

    let mut handles = Vec::with_capacity(config.webhooks.len());
    for webhook in &config.webhooks {
        let manager = RotationManager::from_config(
            webhook.clone(),
            store.clone(),
            store.clone(),
            &config.rotation,
        )?
        .with_error_sink(errors_tx.clone());
        info!(webhook = %webhook, dir = %store.identity_dir(webhook).display(), "managing webhook");
        handles.push(manager.spawn(cancel.child_token()));
    }
    drop(errors_tx);

    let error_log = tokio::spawn(async move {
        while let Some(e) = errors_rx.recv().await {
            warn!(error = %e, "certificate rotation failed, will retry");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping rotation managers");
    cancel.cancel();

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "rotation manager task failed");
        }
    }
    // Every sender is dropped once the managers finish.
    if let Err(e) = error_log.await {
        error!(error = %e, "error log task failed");
    }

    info!("webhook-certd stopped");
    Ok(())
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::sample();
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the file to list your webhooks, then run:");
    println!("  webhook-certd run --config {}", output.display());

    Ok(())
}
