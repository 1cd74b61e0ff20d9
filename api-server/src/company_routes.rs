use axum::{
    extract::State,
    http::StatusCode,
    routing::{delete, get},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tickerpulse_core::{normalize_ticker, Company, CoreError};

use crate::extract::{ApiJson, ApiPath};
use crate::{ApiResponse, AppError, AppState};

#[derive(Debug, Deserialize)]
pub struct CompanyRequest {
    pub ticker: String,
    pub name: String,
    pub sector: Option<String>,
}

pub fn company_routes() -> Router<AppState> {
    Router::new()
        .route("/api/companies", get(list_companies).post(upsert_company))
        .route("/api/companies/:ticker", delete(delete_company))
}

async fn list_companies(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<Company>>>, AppError> {
    Ok(Json(ApiResponse::success(state.db.list_companies().await?)))
}

async fn upsert_company(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CompanyRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Company>>), AppError> {
    let ticker = normalize_ticker(&request.ticker)
        .ok_or_else(|| AppError::bad_request(format!("invalid ticker '{}'", request.ticker)))?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("company name is required"));
    }

    let company = Company {
        ticker,
        name: name.to_string(),
        sector: request
            .sector
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        created_at: Utc::now(),
    };
    state.db.upsert_company(&company).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(company))))
}

async fn delete_company(
    State(state): State<AppState>,
    ApiPath(ticker): ApiPath<String>,
) -> Result<StatusCode, AppError> {
    let ticker = normalize_ticker(&ticker)
        .ok_or_else(|| AppError::bad_request(format!("invalid ticker '{}'", ticker)))?;
    if state.db.delete_company(&ticker).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(CoreError::NotFound {
            resource: format!("company {}", ticker),
        }
        .into())
    }
}
