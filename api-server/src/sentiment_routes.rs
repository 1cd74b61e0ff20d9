//! Read endpoints backing the dashboard.

use axum::{
    extract::State,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use sentiment_engine::query::{
    sentiment_data, AggregateParams, AggregateQuery, Page, PostParams, PostQuery,
    SentimentDataParams, TickerSentiment, Timeframe,
};
use serde::Serialize;
use tickerpulse_core::{normalize_ticker, AnalyzedPost, CoreError, TickerAggregate};

use crate::extract::{ApiPath, ApiQuery};
use crate::{ApiResponse, AppError, AppState};

/// Posts shown alongside a single ticker's rollup.
const RECENT_POSTS: u32 = 10;

#[derive(Debug, Serialize)]
pub struct TickerDetailResponse {
    pub aggregate: TickerAggregate,
    pub sentiment_label: String,
    pub recent_posts: Vec<AnalyzedPost>,
}

pub fn sentiment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/sentiment-data", get(get_sentiment_data))
        .route("/api/sentiment-analysis", get(list_sentiment_analysis))
        .route("/api/sentiment-analysis/:ticker", get(get_ticker_analysis))
        .route("/api/social-posts", get(list_social_posts))
}

async fn get_sentiment_data(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<SentimentDataParams>,
) -> Result<Json<ApiResponse<Vec<TickerSentiment>>>, AppError> {
    let aggregates = state.db.list_aggregates().await?;
    let rows = sentiment_data(&params, &aggregates, Utc::now())?;
    Ok(Json(ApiResponse::success(rows)))
}

async fn list_sentiment_analysis(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<AggregateParams>,
) -> Result<Json<ApiResponse<Page<TickerSentiment>>>, AppError> {
    let query = AggregateQuery::from_params(&params)?;
    let aggregates = state.db.list_aggregates().await?;
    Ok(Json(ApiResponse::success(query.run(&aggregates, Utc::now()))))
}

async fn get_ticker_analysis(
    State(state): State<AppState>,
    ApiPath(ticker): ApiPath<String>,
) -> Result<Json<ApiResponse<TickerDetailResponse>>, AppError> {
    let ticker = normalize_ticker(&ticker)
        .ok_or_else(|| AppError::bad_request(format!("invalid ticker '{}'", ticker)))?;
    let aggregate = state
        .db
        .get_aggregate(&ticker)
        .await?
        .ok_or_else(|| CoreError::NotFound {
            resource: format!("sentiment data for {}", ticker),
        })?;

    let mut query = PostQuery {
        ticker: Some(ticker),
        timeframe: Timeframe::All,
        ..PostQuery::default()
    };
    query.pagination.limit = RECENT_POSTS;
    let recent_posts = query.fetch(&state.db, Utc::now()).await?.items;

    Ok(Json(ApiResponse::success(TickerDetailResponse {
        sentiment_label: aggregate.sentiment_label().to_string(),
        aggregate,
        recent_posts,
    })))
}

async fn list_social_posts(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<PostParams>,
) -> Result<Json<ApiResponse<Page<AnalyzedPost>>>, AppError> {
    let query = PostQuery::from_params(&params)?;
    let page = query.fetch(&state.db, Utc::now()).await?;
    Ok(Json(ApiResponse::success(page)))
}
