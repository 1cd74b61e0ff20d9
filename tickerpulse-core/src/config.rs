//! Application configuration.
//!
//! Values are read from an optional TOML file and then overridden by
//! environment variables, so a deployment can keep secrets out of the file.

use crate::{ConfigError, CoreError, SourceSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_CONFIG_PATH: &str = "tickerpulse.toml";
pub const MAX_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub reddit: RedditConfig,
    pub pipeline: PipelineConfig,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Bearer token guarding the ingestion trigger. Unset disables the trigger.
    pub cron_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            cron_secret: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://tickerpulse.db".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Without a key every batch is classified by the keyword fallback.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
            max_attempts: 2,
            failure_threshold: 3,
            recovery_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_agent: String,
    pub subreddits: Vec<String>,
    pub post_limit: u32,
    pub comments_per_post: u32,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            user_agent: "tickerpulse/0.1".to_string(),
            subreddits: vec![
                "wallstreetbets".to_string(),
                "stocks".to_string(),
                "investing".to_string(),
            ],
            post_limit: 25,
            comments_per_post: 5,
        }
    }
}

impl RedditConfig {
    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            subreddits: self.subreddits.clone(),
            post_limit: self.post_limit,
            comments_per_post: self.comments_per_post,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    /// Hour of day (UTC) for the scheduled run. Unset disables the scheduler.
    pub schedule_hour_utc: Option<u32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            batch_delay_ms: 1000,
            schedule_hour_utc: Some(9),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Map company names from the companies table to tickers when the LLM
    /// is unavailable. Off by default: only `$SYMBOL` tokens are recognized.
    pub resolve_company_names: bool,
}

impl AppConfig {
    /// Loads `path` if it exists, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            info!("Loading config from {}", path.display());
            let contents = std::fs::read_to_string(path)?;
            Self::from_toml(&contents)?
        } else {
            debug!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, CoreError> {
        let config: AppConfig = toml::from_str(contents).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(v) = get("BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = get("CRON_SECRET") {
            self.server.cron_secret = Some(v);
        }
        if let Some(v) = get("OPENAI_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("OPENAI_BASE_URL") {
            self.llm.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = get("OPENAI_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("REDDIT_CLIENT_ID") {
            self.reddit.client_id = Some(v);
        }
        if let Some(v) = get("REDDIT_CLIENT_SECRET") {
            self.reddit.client_secret = Some(v);
        }
        if let Some(v) = get("REDDIT_USER_AGENT") {
            self.reddit.user_agent = v;
        }
        if let Some(v) = get("SENTIMENT_BATCH_SIZE") {
            self.pipeline.batch_size = parse_value("SENTIMENT_BATCH_SIZE", &v)?;
        }
        if let Some(v) = get("SENTIMENT_BATCH_DELAY_MS") {
            self.pipeline.batch_delay_ms = parse_value("SENTIMENT_BATCH_DELAY_MS", &v)?;
        }
        if let Some(v) = get("SCHEDULE_HOUR_UTC") {
            self.pipeline.schedule_hour_utc = if v.eq_ignore_ascii_case("off") {
                None
            } else {
                Some(parse_value("SCHEDULE_HOUR_UTC", &v)?)
            };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pipeline.batch_size == 0 || self.pipeline.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "pipeline.batch_size".to_string(),
                value: self.pipeline.batch_size.to_string(),
            }
            .into());
        }
        if let Some(hour) = self.pipeline.schedule_hour_utc {
            if hour > 23 {
                return Err(ConfigError::InvalidValue {
                    field: "pipeline.schedule_hour_utc".to_string(),
                    value: hour.to_string(),
                }
                .into());
            }
        }
        if self.llm.max_attempts == 0 || self.llm.failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "llm.max_attempts and llm.failure_threshold must be positive".to_string(),
            }
            .into());
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "database.max_connections".to_string(),
                value: "0".to_string(),
            }
            .into());
        }
        self.reddit
            .source_settings()
            .validate()
            .map_err(|e| ConfigError::ValidationFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, CoreError> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
        .into()
    })
}
