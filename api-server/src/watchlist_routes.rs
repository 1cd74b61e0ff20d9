use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tickerpulse_core::{normalize_ticker, CoreError, WatchlistItem};

use crate::extract::{ApiJson, ApiPath};
use crate::{ApiResponse, AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct WatchlistRequest {
    pub ticker: String,
    pub note: Option<String>,
}

pub fn watchlist_routes() -> Router<AppState> {
    Router::new()
        .route("/api/watchlist", get(list_watchlist).post(add_to_watchlist))
        .route("/api/watchlist/:ticker", delete(remove_from_watchlist))
}

async fn list_watchlist(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WatchlistItem>>>, AppError> {
    Ok(Json(ApiResponse::success(state.db.list_watchlist().await?)))
}

async fn add_to_watchlist(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<WatchlistRequest>,
) -> Result<(StatusCode, Json<ApiResponse<WatchlistItem>>), AppError> {
    let ticker = normalize_ticker(&request.ticker)
        .ok_or_else(|| AppError::bad_request(format!("invalid ticker '{}'", request.ticker)))?;

    let item = WatchlistItem {
        ticker,
        note: request.note.filter(|n| !n.trim().is_empty()),
        added_at: Utc::now(),
    };
    if !state.db.add_watchlist_item(&item).await? {
        return Err(CoreError::Conflict {
            message: format!("{} is already on the watchlist", item.ticker),
        }
        .into());
    }
    Ok((StatusCode::CREATED, Json(ApiResponse::success(item))))
}

async fn remove_from_watchlist(
    State(state): State<AppState>,
    ApiPath(ticker): ApiPath<String>,
) -> Result<StatusCode, AppError> {
    let ticker = normalize_ticker(&ticker)
        .ok_or_else(|| AppError::bad_request(format!("invalid ticker '{}'", ticker)))?;
    if state.db.remove_watchlist_item(&ticker).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::NotFound {
            resource: format!("watchlist entry {}", ticker),
        }
        .into())
    }
}
