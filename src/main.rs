//! cesa-scraper entry point: one collect-and-publish run per invocation.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cesa_scraper::config::Config;
use cesa_scraper::pipeline::{self, PipelineError};

/// Collect PetaBencana.id disaster reports and publish them to HDX.
#[derive(Parser, Debug)]
#[command(name = "cesa-scraper", version, about)]
struct Cli {
    /// Override the trailing window length in days.
    #[arg(long, value_parser = clap::value_parser!(i64).range(0..))]
    lookback_days: Option<i64>,

    /// Fetch and write the CSV but skip the catalog publish.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().map_err(PipelineError::Config)?;
    if let Some(days) = cli.lookback_days {
        config.lookback_days = days;
    }
    init_tracing(&config)?;

    match pipeline::run(&config, cli.dry_run).await {
        Ok(summary) => {
            info!(
                rows = summary.rows_written,
                dropped = summary.malformed_dropped,
                empty_types = summary.empty_types.len(),
                action = ?summary.action,
                path = %summary.csv_path.display(),
                "run complete"
            );
            Ok(())
        }
        Err(err) => {
            error!(error = %err, "run failed");
            Err(err.into())
        }
    }
}

/// Structured logs to stderr, or to the configured log file. RUST_LOG
/// overrides the default filter.
fn init_tracing(config: &Config) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cesa_scraper=info"));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Arc::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}
