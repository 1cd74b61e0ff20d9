//! Calls the ingestion endpoint of a running server, for system cron.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tickerpulse_core::{ConfigError, CoreError};
use tracing::{error, info};

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerConfig {
    pub base_url: String,
    pub cron_secret: String,
    pub timeout: Duration,
}

impl TriggerConfig {
    /// Reads `BASE_URL`, `CRON_SECRET` and `REQUEST_TIMEOUT` through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingEnvironmentVariable {
                    var_name: key.to_string(),
                })
        };

        let base_url = required("BASE_URL")?.trim_end_matches('/').to_string();
        let cron_secret = required("CRON_SECRET")?;
        let timeout_secs = match lookup("REQUEST_TIMEOUT") {
            Some(raw) if !raw.trim().is_empty() => {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: "REQUEST_TIMEOUT".to_string(),
                        value: raw.clone(),
                    })?
            }
            _ => DEFAULT_REQUEST_TIMEOUT_SECS,
        };

        Ok(Self {
            base_url,
            cron_secret,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/cron/sentiment-data", self.base_url)
    }
}

/// Fields of the ingestion response worth logging. Missing fields are
/// tolerated so older servers still report success.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    #[serde(default)]
    pub success: bool,
    pub data_points: Option<u64>,
    pub top_posts: Option<u64>,
    pub timestamp: Option<String>,
}

pub async fn trigger(config: &TriggerConfig) -> Result<TriggerResponse, CoreError> {
    let client = Client::builder().timeout(config.timeout).build()?;
    let url = config.endpoint();
    info!("Starting sentiment data fetch from {}", url);

    let response = client
        .post(&url)
        .bearer_auth(&config.cron_secret)
        .json(&json!({}))
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                CoreError::Timeout {
                    seconds: config.timeout.as_secs(),
                }
            } else {
                CoreError::Network(e)
            }
        })?;

    let status = response.status();
    info!("Response status: {}", status);

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        error!("Request failed with status {}: {}", status, body);
        return Err(CoreError::RequestFailed {
            message: body,
            status_code: Some(status.as_u16()),
        });
    }

    let body = response.text().await?;
    let parsed: TriggerResponse = serde_json::from_str(&body)?;
    Ok(parsed)
}
