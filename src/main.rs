use anyhow::Context;
use api_server::AppState;
use background_service::DailyScheduler;
use database::Database;
use llm_interface::{LlmProvider, OpenAiProvider};
use sentiment_engine::{BatchClassifier, IngestionPipeline, PipelineSettings};
use social_client::{PostFetcher, RedditFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use tickerpulse_core::AppConfig;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str =
    "tickerpulse=info,api_server=info,sentiment_engine=info,social_client=info,llm_interface=info,database=info,background_service=info,tower_http=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    tracing::info!("Starting TickerPulse");

    let config_path = std::env::var("TICKERPULSE_CONFIG").ok().map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    let db = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to database")?;
    db.run_migrations().await.context("running migrations")?;

    let reddit: Arc<dyn PostFetcher> =
        Arc::new(RedditFetcher::new(&config.reddit).context("building Reddit client")?);

    let provider = OpenAiProvider::from_config(&config.llm)
        .context("building LLM client")?
        .map(|p| {
            tracing::info!("LLM classification enabled with model {}", p.model());
            Arc::new(p) as Arc<dyn LlmProvider>
        });
    let classifier = BatchClassifier::new(provider, BatchClassifier::retry_config(&config.llm));

    let pipeline = Arc::new(IngestionPipeline::new(
        db.clone(),
        vec![reddit],
        classifier,
        PipelineSettings::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = config.pipeline.schedule_hour_utc.map(|hour| {
        tracing::info!("Daily ingestion scheduled at {:02}:00 UTC", hour);
        let scheduler = DailyScheduler::new(pipeline.clone(), hour);
        tokio::spawn(scheduler.run_until(wait_for(shutdown_rx.clone())))
    });

    if config.server.cron_secret.is_none() {
        tracing::warn!("CRON_SECRET not set, trigger and admin endpoints are disabled");
    }

    let state = AppState {
        db,
        pipeline,
        cron_secret: config.server.cron_secret.as_deref().map(Arc::from),
        default_sources: config.reddit.source_settings(),
    };

    let server = api_server::serve(state, &config.server.bind_addr, async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });
    server.await.context("serving HTTP")?;

    if let Some(handle) = scheduler {
        handle.await.ok();
    }
    tracing::info!("TickerPulse stopped");
    Ok(())
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
