use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use sentiment_engine::AggregationSummary;
use serde::Deserialize;
use tickerpulse_core::{CoreError, SourceSettings};
use tracing::info;

use crate::extract::{ApiJson, ApiQuery};
use crate::{ApiResponse, AppError, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct RebuildQuery {
    /// Only replay posts created within this many days.
    pub days: Option<i64>,
}

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/admin/sources",
            get(get_source_settings).put(update_source_settings),
        )
        .route("/api/admin/rebuild-aggregates", post(rebuild_aggregates))
}

async fn get_source_settings(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<SourceSettings>>, AppError> {
    let settings = state.db.get_source_settings(&state.default_sources).await?;
    Ok(Json(ApiResponse::success(settings)))
}

async fn update_source_settings(
    State(state): State<AppState>,
    ApiJson(settings): ApiJson<SourceSettings>,
) -> Result<Json<ApiResponse<SourceSettings>>, AppError> {
    state.db.save_source_settings(&settings).await?;
    info!(
        "Source settings updated: {} subreddits, {} posts each",
        settings.subreddits.len(),
        settings.post_limit
    );
    Ok(Json(ApiResponse::success(settings)))
}

async fn rebuild_aggregates(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<RebuildQuery>,
) -> Result<Json<ApiResponse<AggregationSummary>>, AppError> {
    if let Some(days) = query.days {
        if days <= 0 {
            return Err(CoreError::InvalidInput {
                message: "days must be positive".to_string(),
            }
            .into());
        }
    }
    let summary = state.pipeline.rebuild(query.days).await?;
    Ok(Json(ApiResponse::success(summary)))
}
