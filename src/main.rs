mod config;
mod exporter;
mod model;
mod normalizer;
mod parser;
mod pipeline;
mod scraper;
mod utils;

use config::load_config;
use exporter::SpreadsheetExporter;
use parser::ListingParser;
use pipeline::{PipelineOptions, RunStatus, harvest};
use scraper::BrowserLauncher;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt::init();

    // Set panic hook to log details about any panic
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic occurred: {}", panic_info);
    }));

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Config load error ({}): {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };

    // Selector rules are checked before any browser is started
    let parser = match ListingParser::new(&config.rules) {
        Ok(p) => p,
        Err(e) => {
            error!("Selector rules rejected: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let exporter = SpreadsheetExporter::new();
    let queries = config.queries();
    let descriptor = config.export_descriptor();
    let options = PipelineOptions::from_config(&config);

    let cancel = CancellationToken::new();
    spawn_stop_listener(cancel.clone());

    info!(
        "Harvesting {} queries with {} worker(s), up to {} pages each -> {}",
        queries.len(),
        options.workers,
        options.max_pages,
        descriptor.path.display()
    );

    let launcher = BrowserLauncher::new(config);
    match harvest(&launcher, &parser, &exporter, queries, &descriptor, &options, cancel).await {
        Ok(report) => {
            report.log_summary();
            match report.status() {
                RunStatus::Complete => ExitCode::SUCCESS,
                RunStatus::Partial => ExitCode::from(2),
            }
        }
        Err(e) => {
            error!("Run failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Ctrl-C stops pagination; collected listings are still exported.
fn spawn_stop_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested, exporting what was collected so far...");
            cancel.cancel();
        }
    });
}
