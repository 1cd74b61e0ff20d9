//! Ingestion trigger, called daily by the `sentiment-cron` binary.

use axum::{extract::State, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use sentiment_engine::RunReport;
use serde::Serialize;
use tracing::info;

use crate::{AppError, AppState};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CronResponse {
    pub success: bool,
    pub data_points: usize,
    pub top_posts: usize,
    pub timestamp: DateTime<Utc>,
    pub report: RunReport,
}

pub fn cron_routes() -> Router<AppState> {
    Router::new().route("/api/cron/sentiment-data", post(run_ingestion))
}

/// Runs one full ingestion. A second trigger while one is running gets 409.
async fn run_ingestion(State(state): State<AppState>) -> Result<Json<CronResponse>, AppError> {
    info!("Ingestion triggered over HTTP");
    let report = state.pipeline.run().await?;

    Ok(Json(CronResponse {
        success: true,
        data_points: report.data_points,
        top_posts: report.top_posts,
        timestamp: report.timestamp,
        report,
    }))
}
