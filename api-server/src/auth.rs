use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::{ApiResponse, AppState};

/// Tokens are compared as fixed-length SHA-256 digests so the comparison
/// time does not depend on where the strings first differ.
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Guards the ingestion trigger and admin endpoints with the cron secret.
pub async fn require_cron_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = state.cron_secret.as_deref() else {
        tracing::warn!(
            "{} called but no cron secret is configured",
            request.uri().path()
        );
        return Err(AuthError::NotConfigured);
    };

    let token = extract_bearer_token(&headers)?;
    if hash_token(&token) != hash_token(expected) {
        tracing::warn!("Invalid cron token attempted: {}", mask_token(&token));
        return Err(AuthError::InvalidToken);
    }

    Ok(next.run(request).await)
}

pub(crate) fn extract_bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or(AuthError::MissingToken)
}

/// First and last four characters only.
pub(crate) fn mask_token(token: &str) -> String {
    if token.len() <= 8 || !token.is_ascii() {
        return "****".to_string();
    }
    format!("{}...{}", &token[..4], &token[token.len() - 4..])
}

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken,
    InvalidToken,
    NotConfigured,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken => write!(f, "Missing bearer token"),
            AuthError::InvalidToken => write!(f, "Invalid bearer token"),
            AuthError::NotConfigured => write!(f, "Cron secret not configured"),
        }
    }
}

impl std::error::Error for AuthError {}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "Missing token. Provide it via the Authorization: Bearer header.",
            ),
            AuthError::InvalidToken => (StatusCode::FORBIDDEN, "Invalid token."),
            AuthError::NotConfigured => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Endpoint disabled: CRON_SECRET is not configured.",
            ),
        };
        (status, Json(ApiResponse::error(message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Bearer abc123"));
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc123");
    }

    #[test]
    fn test_extract_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("Authorization", HeaderValue::from_static("Basic abc123"));
        assert_eq!(extract_bearer_token(&headers), Err(AuthError::MissingToken));

        headers.insert("Authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(extract_bearer_token(&headers), Err(AuthError::MissingToken));

        assert_eq!(
            extract_bearer_token(&HeaderMap::new()),
            Err(AuthError::MissingToken)
        );
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("abcd1234efgh5678"), "abcd...5678");
        assert_eq!(mask_token("short"), "****");
    }
}
