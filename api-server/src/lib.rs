//! HTTP surface of the sentiment dashboard.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use database::Database;
use sentiment_engine::IngestionPipeline;
use serde::Serialize;
use std::sync::Arc;
use tickerpulse_core::retry::CircuitBreakerState;
use tickerpulse_core::{CoreError, ErrorExt, SourceSettings};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod admin_routes;
pub mod auth;
pub mod company_routes;
pub mod cron_routes;
pub mod extract;
pub mod sentiment_routes;
pub mod watchlist_routes;


#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub pipeline: Arc<IngestionPipeline>,
    /// Bearer token for the trigger and admin endpoints. `None` disables them.
    pub cron_secret: Option<Arc<str>>,
    pub default_sources: SourceSettings,
}

/// Standard JSON envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Validation problems are echoed back; anything else is logged and hidden
/// behind a generic message.
impl From<CoreError> for AppError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::InvalidInput { message } => Self::bad_request(message),
            CoreError::NotFound { resource } => Self::not_found(format!("{} not found", resource)),
            CoreError::Conflict { message } => Self::new(StatusCode::CONFLICT, message),
            other => {
                other.log_error();
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::error(self.message))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ingestion_running: bool,
    pub llm_configured: bool,
    pub llm_circuit: &'static str,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let classifier = state.pipeline.classifier();
    let llm_circuit = match classifier.circuit_state() {
        CircuitBreakerState::Closed => "closed",
        CircuitBreakerState::Open => "open",
        CircuitBreakerState::HalfOpen => "half_open",
    };

    Json(HealthResponse {
        status: "ok",
        ingestion_running: state.pipeline.is_running(),
        llm_configured: classifier.has_provider(),
        llm_circuit,
    })
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .merge(cron_routes::cron_routes())
        .merge(admin_routes::admin_routes())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_cron_secret,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .merge(sentiment_routes::sentiment_routes())
        .merge(company_routes::company_routes())
        .merge(watchlist_routes::watchlist_routes())
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind_addr: &str, shutdown: F) -> Result<(), CoreError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
