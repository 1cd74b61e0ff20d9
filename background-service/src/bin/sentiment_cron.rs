//! Daily trigger for system cron: `0 9 * * * sentiment-cron`.
//!
//! Exits 0 when the server reports a completed ingestion, 1 otherwise.

use background_service::trigger::{trigger, TriggerConfig};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const CONFIG_FILE: &str = "config.env";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Daily sentiment ingestion trigger started at {}", chrono::Utc::now().to_rfc3339());

    // Variables already present in the environment take precedence.
    if Path::new(CONFIG_FILE).exists() {
        tracing::info!("Loading config from {}", CONFIG_FILE);
        if let Err(e) = dotenvy::from_path(CONFIG_FILE) {
            tracing::warn!("Could not read {}: {}", CONFIG_FILE, e);
        }
    }

    let config = match TriggerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Configuration loaded, base URL: {}", config.base_url);

    match trigger(&config).await {
        Ok(response) if response.success => {
            tracing::info!("Sentiment data fetch successful");
            tracing::info!("Data points: {}", crate::display(response.data_points));
            tracing::info!("Top posts: {}", crate::display(response.top_posts));
            tracing::info!(
                "Timestamp: {}",
                response.timestamp.as_deref().unwrap_or("N/A")
            );
            ExitCode::SUCCESS
        }
        Ok(_) => {
            tracing::error!("Server reported an unsuccessful run");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("Sentiment ingestion trigger failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn display(value: Option<u64>) -> String {
    value.map_or_else(|| "N/A".to_string(), |v| v.to_string())
}
