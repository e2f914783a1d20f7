//! One collection run, start to finish: window, fetch, table, publish.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{Config, ConfigError};
use crate::hdx::{CatalogApi, HdxClient, PublishError};
use crate::petabencana::{
    fetch_reports, DisasterType, PetabencanaClient, ReportSource, UpstreamError,
};
use crate::publish::{publish_table, PublishAction};
use crate::report::ReportTable;
use crate::window::TimeWindow;

/// Fatal failure of a pipeline stage. Each variant names the stage so the
/// final log line says where the run died.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("fetch stage: {0}")]
    Upstream(#[from] UpstreamError),
    #[error("table stage: {0}")]
    Table(#[from] csv::Error),
    #[error("table stage: {0}")]
    TempDir(#[from] std::io::Error),
    #[error("publish stage: {0}")]
    Publish(#[from] PublishError),
}

/// What one run produced; `main` logs it on success.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub fetched: Vec<(DisasterType, usize)>,
    pub empty_types: Vec<DisasterType>,
    pub rows_written: usize,
    pub malformed_dropped: usize,
    pub csv_path: PathBuf,
    /// `None` on a dry run.
    pub action: Option<PublishAction>,
}

/// Run the pipeline with the real upstream and catalog clients.
pub async fn run(config: &Config, dry_run: bool) -> Result<RunSummary, PipelineError> {
    let source = PetabencanaClient::new(config);
    let catalog = HdxClient::new(&config.hdx_base_url, &config.hdx_api_key, &config.user_agent);
    run_with(&source, &catalog, config, dry_run).await
}

/// Pipeline over explicit collaborators; the integration tests feed
/// scripted pages and an in-memory catalog through here. Stages run
/// strictly in sequence, one disaster type at a time.
pub async fn run_with<S, C>(
    source: &S,
    catalog: &C,
    config: &Config,
    dry_run: bool,
) -> Result<RunSummary, PipelineError>
where
    S: ReportSource + ?Sized,
    C: CatalogApi + ?Sized,
{
    let window = TimeWindow::trailing(Utc::now(), config.lookback_days);
    info!(start = %window.start, end = %window.end, "collection window");

    let mut table = ReportTable::new();
    let mut fetched = Vec::new();
    let mut empty_types = Vec::new();

    for disaster in DisasterType::ALL {
        let reports = fetch_reports(source, disaster, &window).await?;
        if reports.is_empty() {
            warn!(disaster = %disaster, "no reports in window");
            empty_types.push(disaster);
            continue;
        }
        info!(disaster = %disaster, count = reports.len(), "fetched reports");
        fetched.push((disaster, reports.len()));
        for report in &reports {
            table.push_report(report);
        }
    }

    std::fs::create_dir_all(&config.temp_dir)?;
    let csv_path = table.write_csv(&config.temp_dir)?;
    info!(path = %csv_path.display(), rows = table.len(), dropped = table.dropped(), "wrote table");

    let action = if dry_run {
        info!("dry run, skipping publish");
        None
    } else {
        info!(site = %config.hdx_site, "publishing to catalog");
        Some(publish_table(catalog, &window, &csv_path).await?)
    };

    Ok(RunSummary {
        fetched,
        empty_types,
        rows_written: table.len(),
        malformed_dropped: table.dropped(),
        csv_path,
        action,
    })
}
