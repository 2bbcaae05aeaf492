use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use drover_core::FetchWindow;
use drover_sync::{SyncPipeline, SyncSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "drover")]
#[command(about = "dbt Cloud run-metadata sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization pass.
    Sync {
        /// Path to the pipeline configuration document.
        #[arg(long, default_value = "drover.yml")]
        config: PathBuf,
        /// Explicit window start (RFC 3339). Requires --window-end.
        #[arg(long)]
        window_start: Option<DateTime<Utc>>,
        /// Explicit window end (RFC 3339). Requires --window-start.
        #[arg(long)]
        window_end: Option<DateTime<Utc>>,
    },
    /// Load and echo the resolved, secret-free configuration.
    CheckConfig {
        #[arg(long, default_value = "drover.yml")]
        config: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        config: PathBuf::from("drover.yml"),
        window_start: None,
        window_end: None,
    }) {
        Commands::Sync {
            config,
            window_start,
            window_end,
        } => {
            let settings = SyncSettings::load(&config)
                .with_context(|| format!("loading settings from {}", config.display()))?;
            let window = match (window_start, window_end) {
                (Some(start), Some(end)) => FetchWindow::new(start, end),
                (None, None) => settings.default_window(Utc::now()),
                _ => bail!("--window-start and --window-end must be given together"),
            };
            info!(start = %window.start, end = %window.end, "starting sync pass");
            let pipeline =
                SyncPipeline::from_settings(&settings).context("building pipeline clients")?;
            let summary = pipeline.run_once(window).await?;
            println!("sync complete: {summary}");
        }
        Commands::CheckConfig { config } => {
            let settings = SyncSettings::load(&config)
                .with_context(|| format!("loading settings from {}", config.display()))?;
            println!("{}", settings.describe());
        }
    }

    Ok(())
}
